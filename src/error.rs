//! Error types for structured concurrency.

use std::fmt;

use thiserror::Error;

use crate::context::CancelToken;
use crate::task::TaskId;

/// A boxed, type-erased failure carried by a [`ScopeError::ThreadFailed`] error.
///
/// Tasks spawned with `fork`/`fork_with_unmask`/`r#async` run an arbitrary closure;
/// the only "exception" such a closure can raise in Rust is a panic. `Failure`
/// captures the panic payload as a type-erased box so callers can attempt to
/// downcast it back to whatever they panicked with.
pub struct Failure(Box<dyn std::any::Any + Send + 'static>);

impl Failure {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send + 'static>) -> Self {
        Self(payload)
    }

    pub(crate) fn message(&self) -> String {
        self.0
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| self.0.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown panic".to_string())
    }

    /// Attempt to recover the original panic payload as `T`.
    pub fn downcast<T: 'static>(self) -> Result<Box<T>, Self> {
        match self.0.downcast::<T>() {
            Ok(value) => Ok(value),
            Err(payload) => Err(Self(payload)),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.message()).finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Failure {}

impl Clone for Failure {
    fn clone(&self) -> Self {
        Self(Box::new(self.message()))
    }
}

/// Errors surfaced by the scope/context/thread-handle machinery.
///
/// This is the error type users ultimately see. The internal sentinel used to
/// hard-kill a scope (*scope-closing*) never escapes [`scoped`](crate::scope::scoped) —
/// see [`crate::mailbox::Delivery`].
#[derive(Debug, Error)]
pub enum ScopeError {
    /// Attempted to spawn into a scope that has already closed.
    #[error("scope is closed")]
    ScopeClosed,

    /// A child spawned with `fork`/`fork_with_unmask` failed and its failure
    /// propagated, unhandled, to the scope's owner.
    #[error("task {id} failed: {inner}")]
    ThreadFailed { id: TaskId, inner: Failure },

    /// A cancellation token was raised as an exception and did not match the
    /// observing context's own token, so it was not suppressed and propagated
    /// as an ordinary failure instead.
    #[error("cancelled (token {0:?})")]
    CancelToken(CancelToken),
}

impl ScopeError {
    pub(crate) fn thread_failed(id: TaskId, inner: Failure) -> Self {
        ScopeError::ThreadFailed { id, inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_closed_message() {
        let err = ScopeError::ScopeClosed;
        assert_eq!(err.to_string(), "scope is closed");
    }

    #[test]
    fn failure_recovers_string_panic_payload() {
        let failure = Failure::from_panic(Box::new("boom".to_string()));
        assert_eq!(failure.message(), "boom");
    }

    #[test]
    fn failure_downcast_roundtrip() {
        let failure = Failure::from_panic(Box::new(42i32));
        let recovered = failure.downcast::<i32>().unwrap();
        assert_eq!(*recovered, 42);
    }
}
