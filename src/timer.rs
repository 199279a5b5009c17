//! The monotonic timer capability and the `sleep`/`timeout_stm` operations built on it.
//!
//! A [`Deadline`] is the "register a deadline, get back a signal that fires
//! transactionally" host capability: it is just a point in time plus the usual
//! mailbox-racing suspension loop used everywhere else in this crate (see
//! [`crate::mailbox::suspend_until`]), rather than a separate tick thread — at the
//! scale of one deadline per `sleep`/`timeout_stm` call there is nothing for a
//! wheel to amortize.

use std::time::{Duration, Instant};

use crate::context::Context;
use crate::mailbox::{self, Delivery};

/// A point in time, registered once and polled by whoever is racing it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    /// Registers a deadline `duration` from now.
    pub fn register(duration: Duration) -> Self {
        Deadline(Instant::now() + duration)
    }

    /// Whether the deadline has already passed.
    pub fn fired(&self) -> bool {
        Instant::now() >= self.0
    }

    fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }
}

/// Blocks until `ctx` is cancelled or `duration` elapses, whichever comes first.
///
/// If `ctx` is cancelled first, raises its token the same way any other
/// suspension point does — the surrounding scope's own classification decides
/// whether that is expected (cancellation this scope asked for) or a genuine
/// failure (a token smuggled in from elsewhere).
pub fn sleep(ctx: &Context, duration: Duration) {
    let deadline = Deadline::register(duration);
    let mailbox = mailbox::current();
    loop {
        if let Some(token) = ctx.cancelled() {
            std::panic::resume_unwind(Box::new(Delivery::CancelToken(token)));
        }
        if deadline.fired() {
            return;
        }
        if let Some(delivery) = mailbox.try_take() {
            std::panic::resume_unwind(Box::new(delivery));
        }
        mailbox.park_waiting(mailbox::POLL_INTERVAL.min(deadline.remaining()));
    }
}

/// Races `success` (polled repeatedly, like every other suspension point in
/// this crate) against a `duration` deadline. Returns `success`'s value if it
/// completes first; otherwise calls `on_timeout` once the deadline fires.
///
/// `success` should be non-blocking and return `Some` once its condition is
/// met; it is invoked repeatedly, exactly the way [`mailbox::suspend_until`]'s
/// own poll closures are.
pub fn timeout_stm<T>(
    duration: Duration,
    mut success: impl FnMut() -> Option<T>,
    on_timeout: impl FnOnce() -> T,
) -> T {
    let deadline = Deadline::register(duration);
    let mailbox = mailbox::current();
    loop {
        if let Some(value) = success() {
            return value;
        }
        if deadline.fired() {
            return on_timeout();
        }
        if let Some(delivery) = mailbox.try_take() {
            std::panic::resume_unwind(Box::new(delivery));
        }
        mailbox.park_waiting(mailbox::POLL_INTERVAL.min(deadline.remaining()));
    }
}
