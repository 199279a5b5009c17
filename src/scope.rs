//! Scopes: the unit of structured concurrency.
//!
//! A [`Scope`] owns every task spawned into it. `scoped` opens one, runs a body
//! against it, and guarantees every child has terminated — one way or another —
//! before it returns. Three spawn shapes cover the ways a child's outcome can
//! reach the rest of the program:
//!
//! - [`fork`]/[`fork_try`]: failure propagates to the scope's owner, asynchronously,
//!   the same way a signal would interrupt a blocking wait.
//! - [`r#async`]: every outcome, success or failure, is captured in the handle's
//!   slot; nothing ever propagates out-of-band to the scope owner. A captured
//!   failure is re-raised only to whichever task awaits the handle.
//!
//! Both flavors funnel through [`classify_unwind`], which is the one place that
//! decides whether a caught unwind is an ordinary user failure or one of this
//! crate's own simulated deliveries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::context::Context;
use crate::error::{Failure, ScopeError};
use crate::executor;
use crate::mailbox::{self, Delivery, Mailbox};
use crate::mask::{self, MaskState};
use crate::task::{AsyncHandle, SlotWriter, TaskId, ThreadHandle};

/// Capability handed to a task body launched by a `*_with_unmask` variant,
/// letting it temporarily step back to fully interruptible for a section of
/// its own choosing.
pub struct Unmask(());

impl Unmask {
    /// Runs `body` with the calling task fully unmasked, then restores whatever
    /// mask was active before.
    pub fn call<F, R>(&self, body: F) -> R
    where
        F: FnOnce() -> R,
    {
        mask::with_unmask(body)
    }
}

struct ScopeState {
    closed: bool,
    starting_count: usize,
    running: HashMap<TaskId, Arc<Mailbox>>,
}

struct ScopeInner {
    context: Context,
    owner_mailbox: Arc<Mailbox>,
    #[allow(dead_code)] // kept for parity/debugging; closing logic reads current_task_id() directly
    owner_task_id: Option<TaskId>,
    state: Mutex<ScopeState>,
    changed: Condvar,
}

/// A structured-concurrency scope.
///
/// Cheap to clone — clones share the same underlying bookkeeping — which is how
/// a spawned task is handed a reference back to the scope that owns it.
#[derive(Clone)]
pub struct Scope(Arc<ScopeInner>);

impl Scope {
    fn new(parent: &Context) -> Self {
        let scope = Scope(Arc::new(ScopeInner {
            context: parent.derive(),
            owner_mailbox: mailbox::current(),
            owner_task_id: executor::current_task_id(),
            state: Mutex::new(ScopeState {
                closed: false,
                starting_count: 0,
                running: HashMap::new(),
            }),
            changed: Condvar::new(),
        }));
        debug!(owner = ?scope.0.owner_task_id, "scope opened");
        scope
    }

    /// This scope's own node in the cancellation tree.
    pub fn context(&self) -> Context {
        self.0.context.clone()
    }

    fn authorize_spawn(&self) -> Result<(), ScopeError> {
        let mut state = self.0.state.lock();
        if state.closed {
            return Err(ScopeError::ScopeClosed);
        }
        state.starting_count += 1;
        Ok(())
    }

    fn register_running(&self, id: TaskId, mailbox: Arc<Mailbox>) {
        let mut state = self.0.state.lock();
        state.starting_count -= 1;
        state.running.insert(id, mailbox);
        self.0.changed.notify_all();
    }

    fn deregister_running(&self, id: TaskId) {
        let mut state = self.0.state.lock();
        state.running.remove(&id);
        self.0.changed.notify_all();
    }

    /// Blocks until `starting_count = 0` and `running` is empty. Does not close
    /// the scope.
    pub fn wait(&self) {
        let scope = self.clone();
        mailbox::suspend_until(move || {
            let state = scope.0.state.lock();
            if state.starting_count == 0 && state.running.is_empty() {
                Some(())
            } else {
                None
            }
        })
    }

    /// Transactional-read spelling of [`Scope::wait`].
    pub fn wait_stm(&self) {
        self.wait()
    }

    /// Cancels the scope's context, then waits up to `duration` for children to
    /// terminate on their own. Returns `true` if they did; on timeout, hard-closes
    /// the scope (delivering the scope-closing sentinel to whatever remains) and
    /// returns `false`.
    pub fn wait_for(&self, duration: Duration) -> bool {
        self.cancel_scope();
        let deadline = Instant::now() + duration;
        let mailbox = mailbox::current();

        let finished = loop {
            let mut state = self.0.state.lock();
            if state.starting_count == 0 && state.running.is_empty() {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            let wake_by = now + mailbox::POLL_INTERVAL.min(deadline - now);
            self.0.changed.wait_until(&mut state, wake_by);
            drop(state);
            if let Some(delivery) = mailbox.try_take() {
                std::panic::resume_unwind(Box::new(delivery));
            }
        };

        if !finished {
            self.close();
        }
        finished
    }

    /// A soft cancellation request: marks this scope's context (and every live
    /// descendant) cancelled. Does not kill anything by itself.
    pub fn cancel_scope(&self) {
        self.0.context.cancel();
    }

    /// Hard-kill: delivers the scope-closing sentinel to every running child
    /// (other than the closer itself, if the closer happens to be one of them)
    /// and blocks until the scope is fully quiescent. Idempotent.
    fn close(&self) {
        mask::mask_uninterruptible(|| self.close_inner());
    }

    fn close_inner(&self) {
        debug!("scope closing");
        let my_id = executor::current_task_id().filter(|_| self.is_self_owned());

        {
            let mut state = self.0.state.lock();
            loop {
                if state.closed {
                    return;
                }
                if state.starting_count == 0 {
                    break;
                }
                self.0.changed.wait(&mut state);
            }
            state.closed = true;
        }

        let running: Vec<(TaskId, Arc<Mailbox>)> = {
            let state = self.0.state.lock();
            state
                .running
                .iter()
                .map(|(id, mailbox)| (*id, Arc::clone(mailbox)))
                .collect()
        };
        for (id, mailbox) in &running {
            if Some(*id) != my_id {
                mailbox.deliver(Delivery::ScopeClosing);
            }
        }

        loop {
            let mut state = self.0.state.lock();
            let only_self_left = match my_id {
                Some(id) => {
                    state.running.is_empty()
                        || (state.running.len() == 1 && state.running.contains_key(&id))
                }
                None => state.running.is_empty(),
            };
            if only_self_left {
                break;
            }
            self.0.changed.wait(&mut state);
        }

        self.0.context.remove();
        debug!("scope closed");

        if let Some(id) = my_id {
            if self.0.state.lock().running.contains_key(&id) {
                std::panic::resume_unwind(Box::new(Delivery::ScopeClosing));
            }
        }
    }

    /// Whether the calling task is itself one of this scope's running children
    /// (true only when a forked task has been handed a clone of its own scope and
    /// calls back into it, e.g. via `wait_for`).
    fn is_self_owned(&self) -> bool {
        executor::current_task_id()
            .is_some_and(|id| self.0.state.lock().running.contains_key(&id))
    }
}

/// What a caught unwind, from a spawned task body, turns out to mean.
enum CaughtOutcome {
    /// An expected unwind: the scope-closing sentinel, or a cancel token this
    /// scope's own context was in fact cancelled with. Nothing propagates.
    Discard,
    /// A genuine failure: a real panic, a cancel token smuggled in from another
    /// subtree, or a failure forwarded from a nested scope this task owned.
    Failed(Failure),
}

/// Classifies a caught unwind against `ctx` (the context of the scope the
/// failing task was running in), per the exception-propagation policy: the
/// scope-closing sentinel and a matching cancel token are expected and
/// discarded; everything else is a real failure.
fn classify_unwind(payload: Box<dyn std::any::Any + Send>, ctx: &Context) -> CaughtOutcome {
    match payload.downcast::<Delivery>() {
        Ok(delivery) => match *delivery {
            Delivery::ScopeClosing => CaughtOutcome::Discard,
            Delivery::CancelToken(token) => {
                if ctx.cancelled() == Some(token) {
                    CaughtOutcome::Discard
                } else {
                    CaughtOutcome::Failed(Failure::from_panic(Box::new(format!(
                        "{}",
                        ScopeError::CancelToken(token)
                    ))))
                }
            }
            Delivery::ThreadFailed { inner, .. } => CaughtOutcome::Failed(inner),
        },
        Err(payload) => CaughtOutcome::Failed(Failure::from_panic(payload)),
    }
}

fn run_masked<F, R>(initial_mask: MaskState, body: F) -> std::thread::Result<R>
where
    F: FnOnce() -> R,
{
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || match initial_mask {
        MaskState::Unmasked => body(),
        MaskState::MaskedInterruptible => mask::mask_interruptible(body),
        MaskState::MaskedUninterruptible => mask::mask_uninterruptible(body),
    }))
}

/// Runs a `fork`/`fork_try` task body. Success fills the slot; a genuine
/// failure is delivered asynchronously to the owner instead of being written
/// anywhere — an unconsumed failure leaves the slot empty forever, matching the
/// resolved behavior noted in `DESIGN.md`.
fn run_propagating<T, F>(scope: Scope, id: TaskId, mask_state: MaskState, body: F, writer: SlotWriter<T>)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let ctx = scope.context();
    match run_masked(mask_state, body) {
        Ok(value) => writer.fill(value),
        Err(payload) => {
            if let CaughtOutcome::Failed(failure) = classify_unwind(payload, &ctx) {
                debug!(task = ?id, %failure, "child task failed, propagating to owner");
                scope.0.owner_mailbox.deliver(Delivery::thread_failed(id, failure));
            }
        }
    }
}

/// Runs an `async` task body. Every outcome lands in the slot; nothing ever
/// propagates to the owner.
fn run_capturing<T, F>(scope: Scope, mask_state: MaskState, body: F, writer: SlotWriter<Result<T, Failure>>)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let ctx = scope.context();
    match run_masked(mask_state, body) {
        Ok(value) => writer.fill(Ok(value)),
        Err(payload) => {
            if let CaughtOutcome::Failed(failure) = classify_unwind(payload, &ctx) {
                writer.fill(Err(failure));
            }
        }
    }
}

fn spawn_propagating<T, F>(
    scope: &Scope,
    mask_state: MaskState,
    body: F,
) -> Result<ThreadHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    scope.authorize_spawn()?;
    let id = TaskId::new();
    let (handle, writer) = ThreadHandle::new_pair(id);
    let child_mailbox = Arc::new(Mailbox::new());
    scope.register_running(id, Arc::clone(&child_mailbox));
    debug!(task = ?id, "task spawned (propagating)");

    let child_scope = scope.clone();
    executor::spawn_thread(id, move || {
        executor::set_current_task_id(id);
        mailbox::install(child_mailbox);
        run_propagating(child_scope.clone(), id, mask_state, body, writer);
        child_scope.deregister_running(id);
    });

    Ok(handle)
}

fn spawn_capturing<T, F>(
    scope: &Scope,
    mask_state: MaskState,
    body: F,
) -> Result<ThreadHandle<Result<T, Failure>>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    scope.authorize_spawn()?;
    let id = TaskId::new();
    let (handle, writer) = ThreadHandle::new_pair(id);
    let child_mailbox = Arc::new(Mailbox::new());
    scope.register_running(id, Arc::clone(&child_mailbox));
    debug!(task = ?id, "task spawned (capturing)");

    let child_scope = scope.clone();
    executor::spawn_thread(id, move || {
        executor::set_current_task_id(id);
        mailbox::install(child_mailbox);
        run_capturing(child_scope.clone(), mask_state, body, writer);
        child_scope.deregister_running(id);
    });

    Ok(handle)
}

/// Spawns a task whose failure propagates to the scope's owner. The slot is
/// filled only on success.
pub fn fork<T, F>(scope: &Scope, body: F) -> Result<ThreadHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    spawn_propagating(scope, MaskState::Unmasked, body)
}

/// Fire-and-forget spelling of [`fork`]: discards the handle, but a failure
/// still propagates to the owner.
pub fn fork_<F>(scope: &Scope, body: F) -> Result<(), ScopeError>
where
    F: FnOnce() + Send + 'static,
{
    fork(scope, body).map(|_| ())
}

/// Like [`fork`], but the task begins masked-interruptible and is handed an
/// [`Unmask`] capability to step back to unmasked for part of its own body.
pub fn fork_with_unmask<T, F>(scope: &Scope, body: F) -> Result<ThreadHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce(&Unmask) -> T + Send + 'static,
{
    spawn_propagating(scope, MaskState::MaskedInterruptible, move || {
        body(&Unmask(()))
    })
}

/// Fire-and-forget spelling of [`fork_with_unmask`].
pub fn fork_with_unmask_<F>(scope: &Scope, body: F) -> Result<(), ScopeError>
where
    F: FnOnce(&Unmask) + Send + 'static,
{
    fork_with_unmask(scope, body).map(|_| ())
}

/// Spawns a task whose body may fail synchronously with a declared error
/// category `E`: such a failure is captured into the slot as `Err(E)`. A panic
/// outside `E` still propagates to the owner like a plain `fork`.
pub fn fork_try<T, E, F>(scope: &Scope, body: F) -> Result<ThreadHandle<Result<T, E>>, ScopeError>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    spawn_propagating(scope, MaskState::Unmasked, body)
}

/// Spawns a task whose outcome — success or failure — is always captured in
/// the returned handle's slot. Never propagates out-of-band to the scope
/// owner; a captured failure is re-raised as [`ScopeError::ThreadFailed`] only
/// to whichever task calls `await_handle`/`await_stm` on the handle, and only
/// if it ever does.
pub fn r#async<T, F>(scope: &Scope, body: F) -> Result<AsyncHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    spawn_capturing(scope, MaskState::Unmasked, body).map(AsyncHandle::new)
}

/// Like [`r#async`], but the task begins masked-interruptible with an
/// [`Unmask`] capability.
pub fn async_with_unmask<T, F>(scope: &Scope, body: F) -> Result<AsyncHandle<T>, ScopeError>
where
    T: Send + 'static,
    F: FnOnce(&Unmask) -> T + Send + 'static,
{
    spawn_capturing(scope, MaskState::MaskedInterruptible, move || {
        body(&Unmask(()))
    })
    .map(AsyncHandle::new)
}

fn resolve_body_outcome<R>(payload: Box<dyn std::any::Any + Send>) -> R {
    match payload.downcast::<Delivery>() {
        Ok(delivery) => match *delivery {
            Delivery::ThreadFailed { id, inner } => {
                std::panic::panic_any(ScopeError::thread_failed(id, inner))
            }
            other => std::panic::resume_unwind(Box::new(other)),
        },
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

/// Opens a fresh scope derived from `parent`, runs `body(&scope)`, then closes
/// the scope unconditionally — every child has terminated, one way or another,
/// before this function returns.
///
/// If `body` panics with a wrapped thread failure, it is unwrapped and
/// re-raised as [`ScopeError::ThreadFailed`]; any other delivery it panicked
/// with (scope-closing, a smuggled cancel token) is re-propagated unchanged so
/// an enclosing scope's own classification sees it. A genuine panic from
/// `body` itself always takes precedence over a child failure still sitting
/// unread in the mailbox.
pub fn scoped<R>(parent: &Context, body: impl FnOnce(&Scope) -> R) -> R {
    let scope = Scope::new(parent);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&scope)));
    scope.close();

    match outcome {
        Ok(value) => {
            if let Some(Delivery::ThreadFailed { id, inner }) =
                scope.0.owner_mailbox.try_take_ignoring_mask()
            {
                std::panic::panic_any(ScopeError::thread_failed(id, inner));
            }
            value
        }
        Err(payload) => resolve_body_outcome(payload),
    }
}
