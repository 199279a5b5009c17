//! Asynchronous exception delivery, simulated on top of plain OS threads.
//!
//! Rust has no host capability for raising an exception inside another, running
//! thread. Every place structured concurrency calls for delivering one
//! asynchronously — the *scope-closing* sentinel during hard close, a propagated
//! child failure, a raised cancel token — is instead written into the target task's
//! `Mailbox` and observed the next time that task reaches one of this crate's own
//! blocking operations (`wait`, `await_handle`, `sleep`, a cancellation check). Each
//! live task (including the thread that calls [`scoped`](crate::scope::scoped)) owns
//! exactly one mailbox for its lifetime.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::context::CancelToken;
use crate::error::Failure;
use crate::task::TaskId;

/// A pending asynchronous exception, as described in the module docs.
pub(crate) enum Delivery {
    /// Hard-kill sentinel sent by a closing scope to every live child. A task that
    /// "catches" this (observes it at a suspension point while not itself closing)
    /// must treat it as fatal and unwind; the propagation path swallows it only when
    /// it arrives at an already-closed scope.
    ScopeClosing,
    /// A cancellation token raised as an exception (e.g. by `sleep`). Suppressed by
    /// the observing scope only if it matches that scope's own context's token.
    CancelToken(CancelToken),
    /// A child's unhandled failure, propagated to the scope's owner.
    ThreadFailed { id: TaskId, inner: Failure },
}

impl Delivery {
    pub(crate) fn thread_failed(id: TaskId, inner: Failure) -> Self {
        Delivery::ThreadFailed { id, inner }
    }

    fn kind(&self) -> &'static str {
        match self {
            Delivery::ScopeClosing => "scope-closing",
            Delivery::CancelToken(_) => "cancel-token",
            Delivery::ThreadFailed { .. } => "thread-failed",
        }
    }
}

/// A small per-task queue of pending deliveries.
///
/// Using a queue rather than a single overwritable cell means a second delivery
/// arriving while a first is still unread never needs to fail and be retried — it
/// simply queues. The first delivery wins; later ones are discarded by the
/// already-closing parent, because the scope closes (and stops caring) after
/// processing the first one it sees.
pub(crate) struct Mailbox {
    queue: Mutex<VecDeque<Delivery>>,
    arrived: Condvar,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }

    pub(crate) fn deliver(&self, delivery: Delivery) {
        debug!(kind = delivery.kind(), "delivery queued");
        self.queue.lock().push_back(delivery);
        self.arrived.notify_all();
    }

    /// Non-blocking: take the oldest pending delivery, if the calling task's
    /// current mask state allows observing one.
    pub(crate) fn try_take(&self) -> Option<Delivery> {
        if !crate::mask::deliveries_observable() {
            return None;
        }
        self.queue.lock().pop_front()
    }

    /// Like [`Mailbox::try_take`] but ignores the calling task's mask state.
    /// Used only by [`crate::scope::scoped`]'s own close bookkeeping, which runs
    /// after the scope has already closed and is checking for a failure that
    /// arrived but was never raced against a suspension point.
    pub(crate) fn try_take_ignoring_mask(&self) -> Option<Delivery> {
        self.queue.lock().pop_front()
    }

    /// Blocks on `cond`/`lock` (typically the primary condition a caller is already
    /// waiting on) until either a delivery arrives or it is woken spuriously; callers
    /// loop, re-checking both their own condition and `try_take`. `timeout` bounds a
    /// single wait; `None` waits until the delivery's own condvar is notified.
    pub(crate) fn park_waiting(&self, timeout: std::time::Duration) {
        let mut guard = self.queue.lock();
        if !guard.is_empty() {
            return;
        }
        self.arrived.wait_for(&mut guard, timeout);
    }
}

/// How often [`suspend_until`] re-checks its own mailbox while waiting on some other
/// condition. Short enough that cancellation/close latency stays unnoticeable, long
/// enough not to spin.
pub(crate) const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(5);

/// The generic shape of every blocking suspension point in this crate
/// (`Scope::wait`, `ThreadHandle::await_handle`, `sleep`): repeatedly poll a
/// primary condition, but give a pending delivery in the calling task's own
/// mailbox priority over it.
///
/// Rust has no way to asynchronously unwind another thread's stack, so a delivery
/// is turned into a real unwind of *this* thread via [`std::panic::resume_unwind`],
/// carrying the boxed [`Delivery`] as its payload. Callers further up the same task
/// (the scope machinery that originally spawned it) catch that unwind and inspect
/// the payload to tell a simulated delivery apart from a genuine user panic.
pub(crate) fn suspend_until<T>(mut poll: impl FnMut() -> Option<T>) -> T {
    let mailbox = current();
    loop {
        trace!("suspend_until poll");
        if let Some(value) = poll() {
            return value;
        }
        if let Some(delivery) = mailbox.try_take() {
            std::panic::resume_unwind(Box::new(delivery));
        }
        mailbox.park_waiting(POLL_INTERVAL);
    }
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<Mailbox>>> = const { std::cell::RefCell::new(None) };
}

/// Returns the calling task's mailbox, creating one lazily the first time a given OS
/// thread asks. Every thread this crate spawns installs its own mailbox explicitly
/// (via [`install`]) before running user code, so the lazy path here only fires for
/// the original, non-spawned thread that first calls `scoped`.
pub(crate) fn current() -> Arc<Mailbox> {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(mailbox) = slot.as_ref() {
            return Arc::clone(mailbox);
        }
        let mailbox = Arc::new(Mailbox::new());
        *slot = Some(Arc::clone(&mailbox));
        mailbox
    })
}

/// Installs a specific mailbox as the calling thread's own, for the remainder of its
/// lifetime. Used by the executor when it starts a freshly spawned task thread so
/// the scope that spawned it can address deliveries to a mailbox it already holds a
/// handle to, rather than having to discover one after the fact.
pub(crate) fn install(mailbox: Arc<Mailbox>) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(mailbox));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Failure;
    use std::time::Duration;

    #[test]
    fn try_take_returns_none_when_empty() {
        let mailbox = Mailbox::new();
        assert!(mailbox.try_take().is_none());
    }

    #[test]
    fn deliver_then_try_take_round_trips() {
        let mailbox = Mailbox::new();
        mailbox.deliver(Delivery::ScopeClosing);
        assert!(matches!(mailbox.try_take(), Some(Delivery::ScopeClosing)));
        assert!(mailbox.try_take().is_none());
    }

    #[test]
    fn deliveries_are_fifo() {
        let mailbox = Mailbox::new();
        mailbox.deliver(Delivery::thread_failed(
            TaskId::new(),
            Failure::from_panic(Box::new("first".to_string())),
        ));
        mailbox.deliver(Delivery::ScopeClosing);

        match mailbox.try_take() {
            Some(Delivery::ThreadFailed { .. }) => {}
            _ => panic!("expected first delivery"),
        }
        assert!(matches!(mailbox.try_take(), Some(Delivery::ScopeClosing)));
    }

    #[test]
    fn masked_uninterruptible_suppresses_take() {
        let mailbox = Mailbox::new();
        mailbox.deliver(Delivery::ScopeClosing);
        crate::mask::mask_uninterruptible(|| {
            assert!(mailbox.try_take().is_none());
        });
        assert!(mailbox.try_take().is_some());
    }

    #[test]
    fn current_is_stable_within_a_thread() {
        let a = current();
        let b = current();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn install_replaces_current() {
        let fresh = Arc::new(Mailbox::new());
        install(Arc::clone(&fresh));
        assert!(Arc::ptr_eq(&current(), &fresh));
    }

    #[test]
    fn park_waiting_wakes_on_deliver() {
        let mailbox = Arc::new(Mailbox::new());
        let other = Arc::clone(&mailbox);
        let handle = std::thread::spawn(move || {
            other.park_waiting(Duration::from_secs(5));
            other.try_take().is_some()
        });
        std::thread::sleep(Duration::from_millis(10));
        mailbox.deliver(Delivery::ScopeClosing);
        assert!(handle.join().unwrap());
    }
}
