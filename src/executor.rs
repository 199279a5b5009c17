//! The host "spawn a thread" capability [`crate::scope`] builds its task model on.
//!
//! Every task in this crate is one dedicated OS thread for its whole lifetime —
//! there is no work-stealing or thread pooling. This keeps cancellation and
//! mailbox delivery simple: a task's thread-locals (current task id, mailbox,
//! mask state) are set up once, at the very start of the thread, and never need
//! to migrate.

use std::cell::Cell;
use std::thread;

use crate::task::TaskId;
use crate::RuntimeConfig;

static CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// Installs process-wide configuration (thread name prefix, stack size). Call
/// once at startup; if never called, [`RuntimeConfig::default`] is used.
pub fn init(config: RuntimeConfig) {
    let _ = CONFIG.set(config);
}

fn get_config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::default)
}

thread_local! {
    static CURRENT_TASK_ID: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// The identity of the task running on the calling thread, or `None` on a thread
/// this crate never spawned (e.g. the program's original thread before it has
/// entered any scope).
pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK_ID.with(|id| id.get())
}

pub(crate) fn set_current_task_id(id: TaskId) {
    CURRENT_TASK_ID.with(|cell| cell.set(Some(id)));
}

/// Spawns `body` on a dedicated, named OS thread.
///
/// `body` is responsible for installing its own mailbox and mask-state
/// thread-locals and for catching its own panics; this function owns only the
/// host spawn mechanics, matching the split between "host capability" and
/// "structured concurrency policy" the design draws in its external-interfaces
/// section.
pub(crate) fn spawn_thread<F>(id: TaskId, body: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let config = get_config();
    let thread_name = format!("{}-{}", config.thread_name_prefix, id.as_u64());
    let mut builder = thread::Builder::new().name(thread_name);
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }
    builder.spawn(body).expect("failed to spawn thread")
}

/// Yields the calling OS thread. With one thread per task there is no scheduler
/// to hand control back to; this simply asks the OS to run someone else first.
pub fn yield_now() {
    thread::yield_now();
}

/// Number of available CPU cores, useful for sizing a fan-out of `fork`s.
pub fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn set_and_read_current_task_id_round_trips() {
        let id = TaskId::new();
        set_current_task_id(id);
        assert_eq!(current_task_id(), Some(id));
    }

    #[test]
    fn spawn_thread_runs_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = spawn_thread(TaskId::new(), move || flag.store(true, Ordering::SeqCst));
        handle.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn spawned_thread_is_named_with_configured_prefix() {
        let name = Arc::new(Mutex::new(String::new()));
        let captured = Arc::clone(&name);
        let handle = spawn_thread(TaskId::new(), move || {
            *captured.lock() = thread::current().name().unwrap_or_default().to_string();
        });
        handle.join().unwrap();
        assert!(name.lock().starts_with("structura-task-"));
    }

    #[test]
    fn available_parallelism_is_at_least_one() {
        assert!(available_parallelism() >= 1);
    }

    #[test]
    fn yield_now_does_not_panic() {
        yield_now();
    }
}
