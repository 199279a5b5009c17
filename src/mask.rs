//! Interruption masking.
//!
//! Three states, carried in a thread-local so every task — including nested scope
//! bodies running on the same OS thread as their spawner — sees its own current
//! mask:
//!
//! - [`MaskState::Unmasked`]: the default for a freshly spawned task body. Pending
//!   [`Delivery`](crate::mailbox::Delivery)s are observed at the task's next
//!   suspension point.
//! - [`MaskState::MaskedInterruptible`]: set by `with_unmask`'s *caller* frame (i.e.
//!   the task that invoked the unmask capability re-masks when the closure returns);
//!   deliveries are still observed, but only at explicit suspension points.
//! - [`MaskState::MaskedUninterruptible`]: set during scope open/spawn/close
//!   bookkeeping. A task in this state does not look at its mailbox at all, which is
//!   what lets those sequences run atomically.
//!
//! Masking is advisory in the sense that it only changes whether *this crate's own*
//! blocking primitives (`Scope::wait`, `ThreadHandle::await_handle`, `sleep`, ...) poll
//! the mailbox; it cannot stop a task from panicking or from being killed by a
//! scope's own close sequence raising the scope-closing sentinel in itself — masking
//! governs *delivery*, not hard termination.

use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskState {
    Unmasked,
    MaskedInterruptible,
    MaskedUninterruptible,
}

thread_local! {
    static CURRENT_MASK: Cell<MaskState> = const { Cell::new(MaskState::Unmasked) };
}

/// The calling task's current masking state.
pub fn current() -> MaskState {
    CURRENT_MASK.with(|m| m.get())
}

/// Whether the calling task should currently observe mailbox deliveries.
pub fn deliveries_observable() -> bool {
    !matches!(current(), MaskState::MaskedUninterruptible)
}

/// RAII guard restoring the previous mask state on drop (including on unwind).
struct MaskGuard(MaskState);

impl Drop for MaskGuard {
    fn drop(&mut self) {
        CURRENT_MASK.with(|m| m.set(self.0));
    }
}

fn enter(new: MaskState) -> MaskGuard {
    let previous = CURRENT_MASK.with(|m| m.replace(new));
    MaskGuard(previous)
}

/// Runs `body` with async delivery disabled for its duration.
///
/// Used internally for scope open/spawn/close bookkeeping; exposed publicly because
/// user task bodies launched via `fork_with_unmask`/`async_with_unmask` begin masked
/// and need the complementary `with_unmask` to step back out, which is implemented
/// in terms of this same guard.
pub fn mask_uninterruptible<F, R>(body: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = enter(MaskState::MaskedUninterruptible);
    body()
}

/// Runs `body` masked, but still interruptible at explicit suspension points.
pub fn mask_interruptible<F, R>(body: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = enter(MaskState::MaskedInterruptible);
    body()
}

/// Temporarily restores `Unmasked` for the duration of `body`, then returns to
/// whatever mask was active before. This is the capability `with_unmask` variants
/// pass to a masked task body.
pub fn with_unmask<F, R>(body: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = enter(MaskState::Unmasked);
    body()
}
