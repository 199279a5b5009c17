//! The cancellation tree: [`Context`] nodes and the [`CancelToken`]s that mark them.
//!
//! A `Context` is a node in a tree rooted at [`global_context`]. Every [`Scope`](crate::scope::Scope)
//! derives its own context from its parent's when it opens, and deregisters it when it
//! closes. Cancelling a context marks it and every live descendant with a freshly minted
//! [`CancelToken`]; a descendant that is already cancelled keeps its own (earlier) token
//! rather than being rebranded.
//!
//! # Design (structured concurrency core)
//!
//! - Cancellation pushes *down* the tree eagerly rather than being discovered by walking
//!   *up* on read: every live descendant has its `cancel_state` written exactly once, so
//!   `cancelled`/`cancelled_blocking` are always a single local read.
//! - Parents hold only weak references to children: a child's lifetime is owned by the
//!   scope that created it, not by the tree.
//! - `cancel`/`derive` are serialized by a single process-wide lock (`TREE_LOCK`):
//!   without it, a context could be derived from a parent that is cancelled mid-derive
//!   and miss the cancellation. The hot read path (`cancelled`) never touches this lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Process-wide lock serializing `cancel` and `derive` so the cancellation-subtree
/// invariant holds atomically. See the module docs for why this exists.
static TREE_LOCK: Mutex<()> = Mutex::new(());

/// An opaque identity minted for a single cancellation event.
///
/// Two tokens compare equal iff they were produced by the same call to [`cancel`].
/// A token is only ever attached to its originating context and to every descendant
/// the cancellation propagated to — it is never "rebranded" as it propagates.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelToken(u64);

impl CancelToken {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        CancelToken(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancelToken({})", self.0)
    }
}

#[derive(Clone, Copy)]
enum CancelState {
    NotCancelled,
    Cancelled(CancelToken),
}

struct ContextInner {
    id: u64,
    cancel_state: Mutex<CancelState>,
    cancelled_cond: Condvar,
    children: Mutex<Vec<Weak<ContextInner>>>,
    parent: Option<Arc<ContextInner>>,
}

impl std::fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish()
    }
}

/// A node in the cancellation tree.
///
/// Cloning a `Context` is cheap (it is an `Arc` handle to the same node); clones
/// observe the same cancellation state.
#[derive(Clone, Debug)]
pub struct Context(Arc<ContextInner>);

fn next_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Returns the uncancellable root of the cancellation tree.
///
/// Every top-level [`scoped`](crate::scope::scoped) call ultimately derives from this
/// context unless the caller passes a context of their own. Per the data-model
/// invariant, nothing in this crate ever calls `cancel` on the value returned here —
/// `cancel_scope` only ever cancels a *derived* scope context — so it stays
/// uncancelled for the life of the process.
pub fn global_context() -> Context {
    static ROOT: std::sync::OnceLock<Arc<ContextInner>> = std::sync::OnceLock::new();
    let inner = ROOT.get_or_init(|| {
        Arc::new(ContextInner {
            id: next_id(),
            cancel_state: Mutex::new(CancelState::NotCancelled),
            cancelled_cond: Condvar::new(),
            children: Mutex::new(Vec::new()),
            parent: None,
        })
    });
    Context(Arc::clone(inner))
}

impl Context {
    /// Atomically creates a new child context, inheriting `parent`'s current cancel
    /// state, and registers it (weakly) in `parent`'s children.
    ///
    /// If `parent` is already cancelled with token `T`, the child is born cancelled
    /// with `T` — it will never observe an "uncancelled" state.
    pub fn derive(&self) -> Context {
        let _guard = TREE_LOCK.lock();
        let inherited = *self.0.cancel_state.lock();
        let child = Arc::new(ContextInner {
            id: next_id(),
            cancel_state: Mutex::new(inherited),
            cancelled_cond: Condvar::new(),
            children: Mutex::new(Vec::new()),
            parent: Some(Arc::clone(&self.0)),
        });
        self.0.children.lock().push(Arc::downgrade(&child));
        Context(child)
    }

    /// If already cancelled, a no-op. Otherwise mints a fresh [`CancelToken`], marks
    /// `self`, and recursively marks every live descendant that isn't already
    /// cancelled — descendants cancelled earlier (with their own token) keep it.
    pub fn cancel(&self) {
        let _guard = TREE_LOCK.lock();
        let token = {
            let mut state = self.0.cancel_state.lock();
            if let CancelState::Cancelled(_) = *state {
                return;
            }
            let token = CancelToken::new();
            *state = CancelState::Cancelled(token);
            token
        };
        self.0.cancelled_cond.notify_all();
        debug!(context = self.0.id, ?token, "cancellation requested");
        propagate(&self.0, token);
    }

    /// Non-blocking read of the current cancel state.
    pub fn cancelled(&self) -> Option<CancelToken> {
        match *self.0.cancel_state.lock() {
            CancelState::NotCancelled => None,
            CancelState::Cancelled(token) => Some(token),
        }
    }

    /// Blocks until `self` is cancelled, then returns the token.
    ///
    /// This is the "`cancelled_stm`" transactional read from the design: it retries
    /// (here, via a condvar wait loop) until the state is cancelled.
    pub fn cancelled_blocking(&self) -> CancelToken {
        let mut state = self.0.cancel_state.lock();
        loop {
            if let CancelState::Cancelled(token) = *state {
                return token;
            }
            self.0.cancelled_cond.wait(&mut state);
        }
    }

    /// Alias for [`Context::cancelled_blocking`] matching the public surface's
    /// transactional-read naming.
    pub fn cancelled_stm(&self) -> CancelToken {
        self.cancelled_blocking()
    }

    /// Blocks until `self` is cancelled or `deadline` elapses; returns the token in
    /// the former case.
    pub(crate) fn cancelled_before(&self, deadline: std::time::Instant) -> Option<CancelToken> {
        let mut state = self.0.cancel_state.lock();
        loop {
            if let CancelState::Cancelled(token) = *state {
                return Some(token);
            }
            if self.0.cancelled_cond.wait_until(&mut state, deadline).timed_out() {
                return match *state {
                    CancelState::Cancelled(token) => Some(token),
                    CancelState::NotCancelled => None,
                };
            }
        }
    }

    /// Deregisters `self` from its parent's children. Called exactly once, when the
    /// owning scope closes.
    pub(crate) fn remove(&self) {
        let Some(parent) = &self.0.parent else {
            return;
        };
        let mut children = parent.children.lock();
        children.retain(|weak| match weak.upgrade() {
            Some(child) => !Arc::ptr_eq(&child, &self.0),
            None => false,
        });
    }
}

fn propagate(inner: &Arc<ContextInner>, token: CancelToken) {
    let children: Vec<_> = inner.children.lock().clone();
    for weak in children {
        let Some(child) = weak.upgrade() else { continue };
        let mut state = child.cancel_state.lock();
        if matches!(*state, CancelState::NotCancelled) {
            *state = CancelState::Cancelled(token);
            drop(state);
            child.cancelled_cond.notify_all();
            propagate(&child, token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn global_context_starts_uncancelled() {
        assert!(global_context().cancelled().is_none());
    }

    #[test]
    fn derive_inherits_not_cancelled() {
        let parent = global_context().derive();
        let child = parent.derive();
        assert!(child.cancelled().is_none());
    }

    #[test]
    fn cancel_marks_self_and_descendants() {
        let parent = global_context().derive();
        let child = parent.derive();
        let grandchild = child.derive();

        parent.cancel();

        let token = parent.cancelled().expect("parent cancelled");
        assert_eq!(child.cancelled(), Some(token));
        assert_eq!(grandchild.cancelled(), Some(token));
    }

    #[test]
    fn cancel_is_idempotent_same_token() {
        let ctx = global_context().derive();
        ctx.cancel();
        let first = ctx.cancelled().unwrap();
        ctx.cancel();
        let second = ctx.cancelled().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn descendant_already_cancelled_keeps_its_own_token() {
        let parent = global_context().derive();
        let child = parent.derive();

        child.cancel();
        let child_token = child.cancelled().unwrap();

        parent.cancel();
        let parent_token = parent.cancelled().unwrap();

        assert_ne!(child_token, parent_token);
        assert_eq!(child.cancelled(), Some(child_token));
    }

    #[test]
    fn child_derived_after_cancel_is_born_cancelled() {
        let parent = global_context().derive();
        parent.cancel();
        let token = parent.cancelled().unwrap();

        let late_child = parent.derive();
        assert_eq!(late_child.cancelled(), Some(token));
    }

    #[test]
    fn remove_deregisters_from_parent() {
        let parent = global_context().derive();
        let child = parent.derive();
        assert_eq!(parent.0.children.lock().len(), 1);
        child.remove();
        assert_eq!(parent.0.children.lock().len(), 0);
    }

    #[test]
    fn cancelled_blocking_wakes_on_cancel() {
        let ctx = global_context().derive();
        let waiter = ctx.clone();

        let handle = thread::spawn(move || waiter.cancelled_blocking());

        thread::sleep(Duration::from_millis(10));
        ctx.cancel();

        let token = handle.join().unwrap();
        assert_eq!(Some(token), ctx.cancelled());
    }

    #[test]
    fn cancelled_before_times_out_without_cancel() {
        let ctx = global_context().derive();
        let deadline = std::time::Instant::now() + Duration::from_millis(20);
        assert!(ctx.cancelled_before(deadline).is_none());
    }

    #[test]
    fn sibling_cancellation_does_not_affect_other_branch() {
        let parent = global_context().derive();
        let a = parent.derive();
        let b = parent.derive();

        a.cancel();

        assert!(a.cancelled().is_some());
        assert!(b.cancelled().is_none());
    }
}
