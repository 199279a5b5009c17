//! The implicit façade: context and scope ride along in a thread-local binding
//! instead of being passed as arguments.
//!
//! Because every task in this crate is its own OS thread, the ambient binding
//! has to be re-installed explicitly at the start of each spawned thread — it
//! does not cross a `std::thread::spawn` boundary on its own. Every function
//! here does that by capturing the calling thread's ambient context/scope and
//! re-entering it inside the spawned body, before running the user's closure.
//!
//! See [`crate::explicit`] for the same operations with context/scope threaded
//! through explicitly instead.

use std::cell::RefCell;
use std::time::Duration;

use crate::context::{self, Context};
use crate::error::ScopeError;
use crate::scope::{self, Scope, Unmask};
use crate::task::{AsyncHandle, ThreadHandle};

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
    static CURRENT_SCOPE: RefCell<Option<Scope>> = const { RefCell::new(None) };
}

/// Seeds the ambient context with the global root for the duration of `body`.
/// Call once, near the start of a program built on the implicit façade.
pub fn with_global_context<R>(body: impl FnOnce() -> R) -> R {
    with_context(context::global_context(), body)
}

fn with_context<R>(ctx: Context, body: impl FnOnce() -> R) -> R {
    let previous = CURRENT_CONTEXT.with(|cell| cell.replace(Some(ctx)));
    let result = body();
    CURRENT_CONTEXT.with(|cell| *cell.borrow_mut() = previous);
    result
}

fn with_scope<R>(scope: Scope, body: impl FnOnce() -> R) -> R {
    let previous = CURRENT_SCOPE.with(|cell| cell.replace(Some(scope)));
    let result = body();
    CURRENT_SCOPE.with(|cell| *cell.borrow_mut() = previous);
    result
}

/// The ambient context, or the global root if `with_global_context`/`scoped`
/// never established one on this thread.
pub fn current_context() -> Context {
    CURRENT_CONTEXT
        .with(|cell| cell.borrow().clone())
        .unwrap_or_else(context::global_context)
}

fn current_scope() -> Scope {
    CURRENT_SCOPE.with(|cell| cell.borrow().clone()).expect(
        "no ambient scope on this thread: fork/async must run from inside implicit::scoped's body",
    )
}

/// Opens a scope derived from the ambient context. For the duration of `body`,
/// both the new scope and its context become the ambient ones.
pub fn scoped<R>(body: impl FnOnce() -> R) -> R {
    let parent = current_context();
    scope::scoped(&parent, |s| {
        let ctx = s.context();
        with_context(ctx, || with_scope(s.clone(), body))
    })
}

/// Blocks until the ambient scope is quiescent. Does not close it.
pub fn wait() {
    current_scope().wait()
}

/// Alias for [`wait`].
pub fn wait_stm() {
    wait()
}

/// See [`Scope::wait_for`], applied to the ambient scope.
pub fn wait_for(duration: Duration) -> bool {
    current_scope().wait_for(duration)
}

/// Soft-cancels the ambient scope's context.
pub fn cancel_scope() {
    current_scope().cancel_scope()
}

/// Blocks until the ambient context is cancelled or `duration` elapses.
pub fn sleep(duration: Duration) {
    crate::timer::sleep(&current_context(), duration)
}

fn carry_ambient<F, R>(body: F) -> impl FnOnce() -> R
where
    F: FnOnce() -> R,
{
    let ctx = current_context();
    let scope = current_scope();
    move || with_context(ctx, || with_scope(scope, body))
}

/// Spawns a task into the ambient scope; failure propagates to the owner.
pub fn fork<T, F>(body: F) -> Result<ThreadHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let scope = current_scope();
    let wrapped = carry_ambient(body);
    scope::fork(&scope, wrapped)
}

/// Fire-and-forget spelling of [`fork`].
pub fn fork_<F>(body: F) -> Result<(), ScopeError>
where
    F: FnOnce() + Send + 'static,
{
    fork(body).map(|_| ())
}

/// Like [`fork`], but the task starts masked-interruptible with an [`Unmask`]
/// capability.
pub fn fork_with_unmask<T, F>(body: F) -> Result<ThreadHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce(&Unmask) -> T + Send + 'static,
{
    let scope = current_scope();
    let ctx = current_context();
    let scope_for_thread = scope.clone();
    scope::fork_with_unmask(&scope, move |unmask| {
        with_context(ctx, || with_scope(scope_for_thread, || body(unmask)))
    })
}

/// Fire-and-forget spelling of [`fork_with_unmask`].
pub fn fork_with_unmask_<F>(body: F) -> Result<(), ScopeError>
where
    F: FnOnce(&Unmask) + Send + 'static,
{
    fork_with_unmask(body).map(|_| ())
}

/// Spawns a task into the ambient scope whose declared failures of type `E`
/// are captured instead of propagated.
pub fn fork_try<T, E, F>(body: F) -> Result<ThreadHandle<Result<T, E>>, ScopeError>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    let scope = current_scope();
    let wrapped = carry_ambient(body);
    scope::fork_try(&scope, wrapped)
}

/// Spawns a task into the ambient scope whose outcome is always captured.
pub fn r#async<T, F>(body: F) -> Result<AsyncHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let scope = current_scope();
    let wrapped = carry_ambient(body);
    scope::r#async(&scope, wrapped)
}

/// Like [`r#async`], but the task starts masked-interruptible with an
/// [`Unmask`] capability.
pub fn async_with_unmask<T, F>(body: F) -> Result<AsyncHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce(&Unmask) -> T + Send + 'static,
{
    let scope = current_scope();
    let ctx = current_context();
    let scope_for_thread = scope.clone();
    scope::async_with_unmask(&scope, move |unmask| {
        with_context(ctx, || with_scope(scope_for_thread, || body(unmask)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_establishes_ambient_scope_for_fork() {
        let value = with_global_context(|| scoped(|| fork(|| 9).unwrap().await_handle()));
        assert_eq!(value, 9);
    }

    #[test]
    fn nested_fork_sees_its_parent_scope_as_ambient() {
        let value = with_global_context(|| {
            scoped(|| {
                fork(|| fork(|| 3).unwrap().await_handle())
                    .unwrap()
                    .await_handle()
            })
        });
        assert_eq!(value, 3);
    }

    #[test]
    fn cancel_scope_marks_ambient_context() {
        with_global_context(|| {
            scoped(|| {
                cancel_scope();
                assert!(current_context().cancelled().is_some());
            });
        });
    }

    #[test]
    fn wait_blocks_until_ambient_scope_is_quiescent() {
        with_global_context(|| {
            scoped(|| {
                fork_(|| std::thread::sleep(Duration::from_millis(5))).unwrap();
                wait();
            });
        });
    }
}
