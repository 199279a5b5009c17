//! Task identity and the result slot a spawned task's [`ThreadHandle`] reads from.
//!
//! A handle's slot semantics depend on which spawn variant produced it (see
//! `crate::scope`):
//! - `fork`: filled only on success. A failure propagates to the scope's owner
//!   instead of being written here, so the slot stays empty forever — awaiting a
//!   handle whose task failed blocks until the propagated failure reaches the
//!   owner's own mailbox and unwinds it first.
//! - `fork_try::<E>`: `T = Result<U, E>`, filled with `Err(e)` for a declared
//!   failure and `Ok(v)` for success. An undeclared failure (a panic) still
//!   propagates rather than being written here.
//! - `r#async`: `T = Result<U, Failure>`, filled for every outcome. Nothing it
//!   produces ever propagates to the owner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Failure, ScopeError};
use crate::mailbox;

/// Unique identity of a spawned task, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric identity, useful for logging.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

struct Slot<T> {
    value: Mutex<Option<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    fn fill(&self, value: T) {
        *self.value.lock() = Some(value);
    }

    fn is_filled(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Blocks until filled, racing the calling task's own mailbox the way every
    /// suspension point in this crate does (see [`mailbox::suspend_until`]).
    fn take_blocking(&self) -> T {
        mailbox::suspend_until(|| self.value.lock().take())
    }
}

/// The write side of a [`ThreadHandle`]'s slot, held by the scope machinery that
/// runs the spawned task body. Never exposed to users.
pub(crate) struct SlotWriter<T>(Arc<Slot<T>>);

impl<T> SlotWriter<T> {
    pub(crate) fn fill(&self, value: T) {
        self.0.fill(value);
    }
}

/// A handle to a spawned task's eventual result.
///
/// Returned by `fork`, `fork_try`, and `r#async`. Exactly one of `await_handle` /
/// `join` (the two are aliases — `await` is a reserved word in Rust) should be
/// called at most once; both consume the handle.
pub struct ThreadHandle<T> {
    id: TaskId,
    slot: Arc<Slot<T>>,
}

impl<T> PartialEq for ThreadHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ThreadHandle<T> {}

impl<T> PartialOrd for ThreadHandle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ThreadHandle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> ThreadHandle<T> {
    pub(crate) fn new_pair(id: TaskId) -> (Self, SlotWriter<T>) {
        let slot = Arc::new(Slot::new());
        (
            ThreadHandle {
                id,
                slot: Arc::clone(&slot),
            },
            SlotWriter(slot),
        )
    }

    /// The identity of the task behind this handle.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Non-blocking: whether the task's slot has been filled yet.
    pub fn is_finished(&self) -> bool {
        self.slot.is_filled()
    }
}

impl<T: Send + 'static> ThreadHandle<T> {
    /// Blocks until the task's slot is filled and returns the value.
    pub fn await_handle(self) -> T {
        self.slot.take_blocking()
    }

    /// Alias for [`ThreadHandle::await_handle`] (`await` itself is reserved).
    pub fn join(self) -> T {
        self.await_handle()
    }

    /// Transactional-read spelling of [`ThreadHandle::await_handle`].
    pub fn await_stm(self) -> T {
        self.await_handle()
    }

    /// Blocks until the slot is filled or `duration` elapses. On timeout,
    /// returns the handle back so the caller can retry or give up.
    pub fn await_for(self, duration: std::time::Duration) -> Result<T, Self> {
        let mailbox = mailbox::current();
        let deadline = std::time::Instant::now() + duration;
        loop {
            if let Some(value) = self.slot.value.lock().take() {
                return Ok(value);
            }
            if let Some(delivery) = mailbox.try_take() {
                std::panic::resume_unwind(Box::new(delivery));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(self);
            }
            mailbox.park_waiting(mailbox::POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// A handle to a task spawned with `r#async`/`async_with_unmask`.
///
/// Every outcome, success or failure, is captured rather than propagated to the
/// scope owner — but awaiting the handle re-raises a captured failure as
/// [`ScopeError::ThreadFailed`] to the awaiter, the same shape a `fork` failure
/// takes when it reaches the owner. An `AsyncHandle` that is never awaited never
/// raises anything; the failure just sits in the slot until the handle is dropped.
pub struct AsyncHandle<T> {
    id: TaskId,
    inner: ThreadHandle<Result<T, Failure>>,
}

impl<T> AsyncHandle<T> {
    pub(crate) fn new(inner: ThreadHandle<Result<T, Failure>>) -> Self {
        AsyncHandle { id: inner.id(), inner }
    }

    /// The identity of the task behind this handle.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Non-blocking: whether the task's slot has been filled yet.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T: Send + 'static> AsyncHandle<T> {
    /// Blocks until the task's slot is filled. Returns the value on success;
    /// re-raises a captured failure as [`ScopeError::ThreadFailed`] on failure.
    pub fn await_handle(self) -> T {
        match self.inner.await_handle() {
            Ok(value) => value,
            Err(failure) => std::panic::panic_any(ScopeError::thread_failed(self.id, failure)),
        }
    }

    /// Alias for [`AsyncHandle::await_handle`] (`await` itself is reserved).
    pub fn join(self) -> T {
        self.await_handle()
    }

    /// Transactional-read spelling of [`AsyncHandle::await_handle`].
    pub fn await_stm(self) -> T {
        self.await_handle()
    }

    /// Blocks until the slot is filled or `duration` elapses. On timeout,
    /// returns the handle back. On a filled slot, behaves like `await_handle`:
    /// returns the value on success, re-raises on a captured failure.
    pub fn await_for(self, duration: std::time::Duration) -> Result<T, Self> {
        let id = self.id;
        match self.inner.await_for(duration) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => std::panic::panic_any(ScopeError::thread_failed(id, failure)),
            Err(inner) => Err(AsyncHandle { id, inner }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn task_id_display() {
        let (handle, writer) = ThreadHandle::<i32>::new_pair(TaskId::new());
        writer.fill(7);
        assert!(format!("{}", handle.id()).starts_with("Task("));
    }

    #[test]
    fn handle_not_finished_until_filled() {
        let (handle, writer) = ThreadHandle::<i32>::new_pair(TaskId::new());
        assert!(!handle.is_finished());
        writer.fill(42);
        assert!(handle.is_finished());
    }

    #[test]
    fn await_handle_returns_filled_value() {
        let (handle, writer) = ThreadHandle::<&'static str>::new_pair(TaskId::new());
        writer.fill("done");
        assert_eq!(handle.await_handle(), "done");
    }

    #[test]
    fn join_is_an_alias_for_await_handle() {
        let (handle, writer) = ThreadHandle::<i32>::new_pair(TaskId::new());
        writer.fill(9);
        assert_eq!(handle.join(), 9);
    }

    #[test]
    fn await_handle_blocks_until_another_thread_fills_it() {
        let (handle, writer) = ThreadHandle::<i32>::new_pair(TaskId::new());
        let join = std::thread::spawn(move || handle.await_handle());
        std::thread::sleep(std::time::Duration::from_millis(10));
        writer.fill(99);
        assert_eq!(join.join().unwrap(), 99);
    }

    #[test]
    fn async_handle_await_returns_captured_success() {
        let (inner, writer) = ThreadHandle::<Result<i32, Failure>>::new_pair(TaskId::new());
        let handle = AsyncHandle::new(inner);
        writer.fill(Ok(5));
        assert_eq!(handle.await_handle(), 5);
    }

    #[test]
    fn async_handle_await_reraises_captured_failure() {
        let (inner, writer) = ThreadHandle::<Result<i32, Failure>>::new_pair(TaskId::new());
        let id = inner.id();
        let handle = AsyncHandle::new(inner);
        writer.fill(Err(Failure::from_panic(Box::new("boom".to_string()))));
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle.await_handle()));
        let payload = result.unwrap_err();
        let err = payload
            .downcast_ref::<ScopeError>()
            .expect("panic payload should be a ScopeError");
        match err {
            ScopeError::ThreadFailed { id: failed_id, inner } => {
                assert_eq!(*failed_id, id);
                assert_eq!(inner.to_string(), "boom");
            }
            other => panic!("expected ThreadFailed, got {other:?}"),
        }
    }

    #[test]
    fn async_handle_not_finished_until_filled() {
        let (inner, writer) = ThreadHandle::<Result<i32, Failure>>::new_pair(TaskId::new());
        let handle = AsyncHandle::new(inner);
        assert!(!handle.is_finished());
        writer.fill(Ok(1));
        assert!(handle.is_finished());
    }
}
