use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::executor::TaskHandle;
use crate::models::{PolicyError, TaskFailure, TaskPanicked};

/// Value returned by `on_start` and handed back to `on_end`.
pub type StartContext = Arc<dyn Any + Send + Sync>;

/// One-shot notification registered on an executor.
pub type ThresholdCallback = Arc<dyn Fn() + Send + Sync>;

/// Observer of a task's lifecycle. Every method has a no-op default, so implementors
/// override only what they need.
///
/// Methods run synchronously: `on_submit` on the submitter, `on_start` and `on_end`
/// on whatever runs the task, `on_cancel` on the canceller. An `Err` or a panic from
/// `on_submit`/`on_start` aborts the task, and so does cancelling it from inside
/// `on_start`. Panics from the other methods are logged.
pub trait TaskCallback: Send + Sync {
    /// `invoke_any_count` is the number of tasks still competing in an `invoke_any`
    /// group, or `None` outside one.
    fn on_submit(
        &self,
        _task: &TaskHandle,
        _invoke_any_count: Option<usize>,
    ) -> Result<(), TaskFailure> {
        Ok(())
    }

    fn on_start(&self, _task: &TaskHandle) -> Result<Option<StartContext>, TaskFailure> {
        Ok(None)
    }

    /// `aborted` is true when the body never ran. `pending` is the count of deferred
    /// completions still held when the body ended, or `-1` for each later release.
    fn on_end(
        &self,
        _task: &TaskHandle,
        _start: Option<&StartContext>,
        _aborted: bool,
        _pending: i32,
        _failure: Option<&TaskFailure>,
    ) {
    }

    fn on_cancel(&self, _task: &TaskHandle, _timed_out: bool, _while_running: bool) {}

    /// Start timeout for this task given the executor's configured value.
    fn start_timeout(&self, configured: Option<Duration>) -> Option<Duration> {
        configured
    }

    /// Maps the error surfaced to callers waiting on an aborted task.
    fn raise_aborted(&self, cause: PolicyError) -> PolicyError {
        cause
    }

    fn name(&self) -> Option<String> {
        None
    }
}

/// Runs a callback method, turning a panic into a failure value.
pub(crate) fn guarded<R>(
    hook: &'static str,
    task: &TaskHandle,
    operation: impl FnOnce() -> R,
) -> Result<R, TaskFailure> {
    catch_unwind(AssertUnwindSafe(operation)).map_err(|payload| {
        let panicked = TaskPanicked::from_payload(payload);
        tracing::error!(
            hook,
            executor = task.executor_identifier(),
            task_id = task.id().0,
            message = %panicked.message,
            "task callback panicked"
        );
        Arc::new(panicked) as TaskFailure
    })
}
