use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::executor::callback::{StartContext, TaskCallback, guarded};
use crate::executor::group::InvokeAnyGroup;
use crate::executor::policy_executor::ExecutorShared;
use crate::executor::{PolicyExecutor, TaskCancellationToken};
use crate::models::{
    AwaitOutcome, PolicyError, PolicyErrorKind, TaskError, TaskFailure, TaskId, TaskState,
};
use crate::task_context::{ExecutorKey, TaskScope, current_scope};

pub(crate) enum BodyOutcome {
    Completed,
    Failed(TaskFailure),
}

pub(crate) type TaskBody =
    Box<dyn FnOnce(TaskCancellationToken) -> BoxFuture<'static, BodyOutcome> + Send>;

/// A task that has passed `on_submit` and is waiting to be admitted or run.
pub(crate) struct QueuedTask {
    pub(crate) handle: TaskHandle,
    pub(crate) body: TaskBody,
}

pub(crate) fn wrap_body<T, F, Fut, E>(task: F, slot: Arc<Mutex<Option<T>>>) -> TaskBody
where
    T: Send + 'static,
    F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<Box<dyn Error + Send + Sync + 'static>>,
{
    Box::new(move |token| {
        Box::pin(async move {
            match task(token).await {
                Ok(value) => {
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                    BodyOutcome::Completed
                }
                Err(error) => BodyOutcome::Failed(Arc::from(error.into())),
            }
        })
    })
}

struct TaskTimes {
    accept_begin: Instant,
    accept_end: OnceLock<Instant>,
    queue_end: OnceLock<Instant>,
    run_end: OnceLock<Instant>,
}

pub(crate) struct TaskCore {
    id: TaskId,
    executor_identifier: Arc<str>,
    executor_key: ExecutorKey,
    executor: Weak<ExecutorShared>,
    callback: Option<Arc<dyn TaskCallback>>,
    state: watch::Sender<TaskState>,
    token: TaskCancellationToken,
    times: TaskTimes,
    start_deadline: Option<Instant>,
    abort_cause: OnceLock<PolicyError>,
    failure: OnceLock<TaskFailure>,
    group: Option<Arc<InvokeAnyGroup>>,
    starting: AtomicBool,
    cancel_notified: AtomicBool,
    ended: AtomicBool,
}

pub(crate) struct TaskCoreInit {
    pub(crate) id: TaskId,
    pub(crate) executor_identifier: Arc<str>,
    pub(crate) executor_key: ExecutorKey,
    pub(crate) executor: Weak<ExecutorShared>,
    pub(crate) callback: Option<Arc<dyn TaskCallback>>,
    pub(crate) start_timeout: Option<Duration>,
    pub(crate) group: Option<Arc<InvokeAnyGroup>>,
}

/// Type-erased view of a submitted task: state, timings and cancellation.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    pub(crate) fn new(init: TaskCoreInit) -> Self {
        let accept_begin = Instant::now();
        let (state, _) = watch::channel(TaskState::Presubmit);
        Self {
            core: Arc::new(TaskCore {
                id: init.id,
                executor_identifier: init.executor_identifier,
                executor_key: init.executor_key,
                executor: init.executor,
                callback: init.callback,
                state,
                token: TaskCancellationToken::new(),
                times: TaskTimes {
                    accept_begin,
                    accept_end: OnceLock::new(),
                    queue_end: OnceLock::new(),
                    run_end: OnceLock::new(),
                },
                start_deadline: init
                    .start_timeout
                    .and_then(|timeout| accept_begin.checked_add(timeout)),
                abort_cause: OnceLock::new(),
                failure: OnceLock::new(),
                group: init.group,
                starting: AtomicBool::new(false),
                cancel_notified: AtomicBool::new(false),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn executor_identifier(&self) -> &str {
        &self.core.executor_identifier
    }

    pub fn name(&self) -> Option<String> {
        let callback = self.core.callback.as_ref()?;
        guarded("name", self, || callback.name()).ok().flatten()
    }

    pub fn state(&self) -> TaskState {
        *self.core.state.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    pub fn failure(&self) -> Option<TaskFailure> {
        self.core.failure.get().cloned()
    }

    pub fn abort_cause(&self) -> Option<PolicyError> {
        self.core.abort_cause.get().cloned()
    }

    /// Time spent getting the task accepted (queued, dispatched or handed to the
    /// caller). Still growing while the submission waits for queue space.
    pub fn elapsed_accept_time(&self) -> Duration {
        let times = &self.core.times;
        times
            .accept_end
            .get()
            .copied()
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(times.accept_begin)
    }

    pub fn elapsed_queue_time(&self) -> Duration {
        let times = &self.core.times;
        match (times.accept_end.get(), times.queue_end.get()) {
            (Some(accepted), Some(started)) => started.saturating_duration_since(*accepted),
            (Some(accepted), None) if self.state() == TaskState::Submitted => {
                accepted.elapsed()
            }
            _ => Duration::ZERO,
        }
    }

    pub fn elapsed_run_time(&self) -> Duration {
        let times = &self.core.times;
        match (times.queue_end.get(), times.run_end.get()) {
            (Some(started), Some(ended)) => ended.saturating_duration_since(*started),
            (Some(started), None) if !self.state().is_terminal() => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Cancels the task. Before it starts, the task goes straight to `Cancelled` and
    /// leaves the queue. A cancel while `on_start` runs aborts the task instead. While
    /// it runs, it goes through `Cancelling`, `on_cancel` is invoked here, and with
    /// `interrupt` the body is signalled and stops being polled.
    /// Returns false when the task had already finished or was already cancelled.
    pub fn cancel(&self, interrupt: bool) -> bool {
        if self.core.starting.load(Ordering::SeqCst) {
            let cause = PolicyError::new(
                PolicyErrorKind::Interrupted,
                "task cancelled while starting",
            );
            if self.mark_aborted(cause) {
                self.fire_on_cancel(false, false);
                return true;
            }
        }
        if self.transition(&[TaskState::Presubmit, TaskState::Submitted], TaskState::Cancelled) {
            self.close_times();
            self.fire_on_cancel(false, false);
            if let Some(shared) = self.core.executor.upgrade()
                && PolicyExecutor::from_shared(shared).remove_queued(self.id())
            {
                self.fire_on_end(None, true, 0, None);
            }
            return true;
        }
        if self.transition(&[TaskState::Running], TaskState::Cancelling) {
            self.fire_on_cancel(false, true);
            if interrupt {
                self.core.token.cancel();
            }
            self.transition(&[TaskState::Cancelling], TaskState::Cancelled);
            return true;
        }
        false
    }

    /// Waits until the task is done, or until `timeout` elapses. Waiting on oneself
    /// from inside the task's own body returns `Reentrant` instead of hanging.
    pub async fn await_state(&self, timeout: Option<Duration>) -> AwaitOutcome {
        let current = self.state();
        if current.is_done() {
            return AwaitOutcome::Completed(current);
        }
        if current_scope() == Some(self.scope()) {
            return AwaitOutcome::Reentrant(current);
        }

        let mut receiver = self.core.state.subscribe();
        let wait = async {
            receiver
                .wait_for(|state| state.is_done())
                .await
                .map(|state| *state)
                .unwrap_or_else(|_| self.state())
        };
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(state) => AwaitOutcome::Completed(state),
                Err(_) => AwaitOutcome::TimedOut,
            },
            None => AwaitOutcome::Completed(wait.await),
        }
    }

    pub(crate) fn scope(&self) -> TaskScope {
        TaskScope {
            executor: self.core.executor_key,
            task: self.core.id,
        }
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<TaskState> {
        self.core.state.subscribe()
    }

    /// Set while `on_start` runs. The worker settles the `on_end` of a task aborted in
    /// that window.
    pub(crate) fn set_starting(&self, starting: bool) {
        self.core.starting.store(starting, Ordering::SeqCst);
    }

    pub(crate) fn token(&self) -> &TaskCancellationToken {
        &self.core.token
    }

    pub(crate) fn callback(&self) -> Option<&Arc<dyn TaskCallback>> {
        self.core.callback.as_ref()
    }

    pub(crate) fn start_deadline(&self) -> Option<Instant> {
        self.core.start_deadline
    }

    pub(crate) fn start_deadline_passed(&self, now: Instant) -> bool {
        self.core.start_deadline.is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn queue_delay(&self) -> Duration {
        self.core
            .times
            .queue_end
            .get()
            .copied()
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.core.times.accept_begin)
    }

    pub(crate) fn mark_accepted(&self) {
        let _ = self.core.times.accept_end.set(Instant::now());
    }

    pub(crate) fn mark_started(&self) {
        let now = Instant::now();
        let _ = self.core.times.accept_end.set(now);
        let _ = self.core.times.queue_end.set(now);
    }

    pub(crate) fn mark_ended(&self) {
        let _ = self.core.times.run_end.set(Instant::now());
    }

    fn close_times(&self) {
        self.mark_started();
        self.mark_ended();
    }

    /// Compare-and-set on the task state.
    pub(crate) fn transition(&self, from: &[TaskState], to: TaskState) -> bool {
        let mut previous = None;
        let changed = self.core.state.send_if_modified(|state| {
            if from.contains(state) && state.can_transition_to(to) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(
                executor = %self.core.executor_identifier,
                task_id = self.core.id.0,
                from = ?previous,
                to = ?to,
                "task state changed"
            );
            if to.is_terminal()
                && let Some(group) = &self.core.group
            {
                group.task_finished(self.core.id);
            }
        }
        changed
    }

    /// Aborts a task that has not started. Fires `on_cancel` when the abort is a
    /// start timeout, then `on_end` with `aborted = true`.
    pub(crate) fn abort(&self, cause: PolicyError, timed_out: bool) -> bool {
        if !self.mark_aborted(cause) {
            return false;
        }
        if timed_out {
            self.fire_on_cancel(true, false);
        }
        let failure = self
            .abort_cause()
            .map(|cause| -> TaskFailure { Arc::new(cause) });
        self.fire_on_end(None, true, 0, failure.as_ref());
        true
    }

    /// Moves a task that has not started to `Aborted` without invoking callbacks.
    fn mark_aborted(&self, cause: PolicyError) -> bool {
        let cause = cause.for_executor(&self.core.executor_identifier).for_task(self.id());
        let _ = self.core.abort_cause.set(cause.clone());
        if !self.transition(&[TaskState::Presubmit, TaskState::Submitted], TaskState::Aborted) {
            return false;
        }
        self.close_times();
        tracing::debug!(
            executor = %self.core.executor_identifier,
            task_id = self.core.id.0,
            kind = ?cause.kind,
            message = %cause.message,
            "task aborted"
        );
        true
    }

    /// Records the body's outcome. Loses against a concurrent cancel, in which case the
    /// task stays cancelled.
    pub(crate) fn complete(&self, failure: Option<TaskFailure>) -> bool {
        self.mark_ended();
        match failure {
            Some(failure) => {
                let _ = self.core.failure.set(failure);
                self.transition(&[TaskState::Running], TaskState::Failed)
            }
            None => self.transition(&[TaskState::Running], TaskState::Success),
        }
    }

    /// Settles a body that stopped without completing (interrupted or abandoned).
    pub(crate) fn settle_cancelled(&self) {
        self.mark_ended();
        if self.transition(&[TaskState::Running], TaskState::Cancelling) {
            self.fire_on_cancel(false, true);
        }
        self.transition(&[TaskState::Cancelling], TaskState::Cancelled);
    }

    pub(crate) fn fire_on_cancel(&self, timed_out: bool, while_running: bool) {
        if self.core.cancel_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = &self.core.callback {
            let _ = guarded("on_cancel", self, || {
                callback.on_cancel(self, timed_out, while_running)
            });
        }
    }

    /// First `on_end` for the task; later calls are ignored.
    pub(crate) fn fire_on_end(
        &self,
        start: Option<&StartContext>,
        aborted: bool,
        pending: i32,
        failure: Option<&TaskFailure>,
    ) {
        if self.core.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = &self.core.callback {
            let _ = guarded("on_end", self, || {
                callback.on_end(self, start, aborted, pending, failure)
            });
        }
    }

    /// Error surfaced to callers of an aborted task, after `raise_aborted`.
    pub(crate) fn raised_abort_cause(&self) -> PolicyError {
        let cause = self.abort_cause().unwrap_or_else(|| {
            PolicyError::new(PolicyErrorKind::Internal, "task aborted without a cause")
                .for_executor(&self.core.executor_identifier)
                .for_task(self.id())
        });
        match &self.core.callback {
            Some(callback) => guarded("raise_aborted", self, || {
                callback.raise_aborted(cause.clone())
            })
            .unwrap_or(cause),
            None => cause,
        }
    }
}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("executor", &self.core.executor_identifier)
            .field("state", &self.state())
            .finish()
    }
}

impl Display for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task {} of {} [{:?}] accept {:?} queue {:?} run {:?}",
            self.core.id,
            self.core.executor_identifier,
            self.state(),
            self.elapsed_accept_time(),
            self.elapsed_queue_time(),
            self.elapsed_run_time()
        )?;
        if let Some(name) = self.name() {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

/// Handle to a task's eventual result.
pub struct TaskFuture<T> {
    handle: TaskHandle,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<T> Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TaskFuture").field(&self.handle).finish()
    }
}

impl<T> TaskFuture<T> {
    pub(crate) fn new(handle: TaskHandle, slot: Arc<Mutex<Option<T>>>) -> Self {
        Self { handle, slot }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub fn cancel(&self, interrupt: bool) -> bool {
        self.handle.cancel(interrupt)
    }

    pub async fn await_state(&self, timeout: Option<Duration>) -> AwaitOutcome {
        self.handle.await_state(timeout).await
    }

    /// Waits for the task and takes its value.
    pub async fn join(self) -> Result<T, TaskError> {
        let state = self.wait(None).await?;
        self.settle(state, Option::take)
    }

    pub(crate) fn take_value(&self) -> Option<T> {
        self.lock_slot().take()
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<TaskState, TaskError> {
        match self.handle.await_state(timeout).await {
            AwaitOutcome::Completed(state) => Ok(state),
            AwaitOutcome::Reentrant(_) => Err(TaskError::SelfWait),
            AwaitOutcome::TimedOut => Err(TaskError::Timeout(timeout.unwrap_or_default())),
        }
    }

    fn settle<R>(
        &self,
        state: TaskState,
        read: impl FnOnce(&mut Option<T>) -> Option<R>,
    ) -> Result<R, TaskError> {
        match state {
            TaskState::Success => read(&mut self.lock_slot()).ok_or_else(|| {
                TaskError::Aborted(
                    PolicyError::new(PolicyErrorKind::IllegalState, "task result already taken")
                        .for_executor(self.handle.executor_identifier())
                        .for_task(self.id()),
                )
            }),
            TaskState::Failed => Err(TaskError::Failed(self.handle.failure().unwrap_or_else(
                || {
                    Arc::new(PolicyError::new(
                        PolicyErrorKind::Internal,
                        "task failed without a recorded error",
                    ))
                },
            ))),
            TaskState::Aborted => Err(TaskError::Aborted(self.handle.raised_abort_cause())),
            _ => Err(TaskError::Cancelled),
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> TaskFuture<T> {
    pub async fn get(&self) -> Result<T, TaskError> {
        let state = self.wait(None).await?;
        self.settle(state, |slot| slot.clone())
    }

    pub async fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        let state = self.wait(Some(timeout)).await?;
        self.settle(state, |slot| slot.clone())
    }
}
