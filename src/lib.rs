//! Structured concurrency primitives: scopes that own every task spawned into
//! them, a tree of cancellable contexts, and the handles/timers built on top.
//!
//! - [`Scope`] / [`scope::scoped`] - a structured concurrency scope: no task
//!   spawned into it can outlive the call that opened it.
//! - [`context::Context`] / [`context::CancelToken`] - the cancellation tree a
//!   scope's context lives in.
//! - [`task::ThreadHandle`] - a handle to a spawned task's eventual result.
//! - [`timer`] - the monotonic-deadline primitive behind `sleep`/`timeout_stm`.
//! - [`explicit`] / [`implicit`] - the same operations with context/scope
//!   threaded through explicitly, or carried ambiently on a thread-local.
//!
//! # Design goals
//!
//! - Every spawned task terminates before the scope that owns it returns,
//!   on every exit path (normal, child failure, or a hard cancel).
//! - Cancellation is cooperative and pushed down a tree of [`context::Context`]
//!   nodes eagerly, so the hot read path (`cancelled`) never walks upward.
//! - Thread-per-task: no work-stealing or pooling. Keeps mailbox delivery and
//!   cancellation simple at the cost of OS-thread spawn overhead per task.

pub mod context;
pub mod error;
pub mod executor;
pub mod explicit;
pub mod implicit;
pub(crate) mod mailbox;
pub mod mask;
pub mod scope;
pub mod task;
pub mod timer;

pub use context::{global_context, CancelToken, Context};
pub use error::{Failure, ScopeError};
pub use executor::{available_parallelism, yield_now};
pub use mask::MaskState;
pub use scope::{
    async_with_unmask, fork, fork_, fork_try, fork_with_unmask, fork_with_unmask_, r#async,
    scoped, Scope, Unmask,
};
pub use task::{AsyncHandle, TaskId, ThreadHandle};
pub use timer::{sleep, timeout_stm, Deadline};

/// Configuration for the runtime.
///
/// Currently supports basic thread-per-task execution.
/// Future versions will support work-stealing scheduler.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name prefix for spawned threads
    pub thread_name_prefix: String,
    /// Stack size for spawned threads (bytes)
    pub stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "structura-task".to_string(),
            stack_size: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for spawned threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.thread_name_prefix, "structura-task");
        assert!(config.stack_size.is_none());
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_thread_name_prefix("custom")
            .with_stack_size(1024 * 1024);

        assert_eq!(config.thread_name_prefix, "custom");
        assert_eq!(config.stack_size, Some(1024 * 1024));
    }
}
