use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Notify, watch};

use crate::config::{PolicyConfig, duration_millis};
use crate::executor::callback::{StartContext, TaskCallback, ThresholdCallback, guarded};
use crate::executor::future::{BodyOutcome, QueuedTask, TaskCoreInit, wrap_body};
use crate::executor::group::InvokeAnyGroup;
use crate::executor::pool::{BackingPool, PoolJob};
use crate::executor::provider::Registry;
use crate::executor::{PolicyResult, TaskCancellationToken, TaskFuture, TaskHandle};
use crate::models::{
    ExecutorState, Limit, MaxPolicy, PolicyError, PolicyErrorKind, QueueFullAction, TaskFailure,
    TaskId, TaskPanicked, TaskState,
};
use crate::task_context::{ExecutorKey, current_scope, with_task_scope};

const INTROSPECT_QUEUE_LIMIT: usize = 50;

/// Admission-control overlay on a shared [`BackingPool`].
///
/// Cloning is cheap and every clone drives the same executor. Tasks first try to
/// dispatch straight to the pool; beyond `max_concurrency` they wait in a FIFO queue
/// bounded by `max_queue_size`, and beyond that `queue_full_action` decides.
#[derive(Clone)]
pub struct PolicyExecutor {
    shared: Arc<ExecutorShared>,
}

pub(crate) struct ExecutorShared {
    identifier: Arc<str>,
    owner: Option<String>,
    pool: Arc<dyn BackingPool>,
    registry: Option<Weak<Registry>>,
    inner: Mutex<ExecutorInner>,
    lifecycle: watch::Sender<ExecutorState>,
    queue_space: Notify,
    next_task_id: AtomicU64,
}

struct Threshold<V> {
    limit: V,
    callback: ThresholdCallback,
}

struct ExecutorInner {
    state: ExecutorState,
    core_concurrency: usize,
    max_concurrency: Limit,
    max_policy: MaxPolicy,
    max_queue_size: Limit,
    max_wait_for_enqueue: Duration,
    queue_full_action: QueueFullAction,
    start_timeout: Option<Duration>,
    queue: VecDeque<QueuedTask>,
    workers: usize,
    expedited_workers: usize,
    caller_permits: usize,
    running: BTreeMap<TaskId, TaskHandle>,
    concurrency_callback: Option<Threshold<usize>>,
    late_start_callback: Option<Threshold<Duration>>,
    queue_size_callback: Option<Threshold<usize>>,
}

impl ExecutorInner {
    fn new() -> Self {
        Self {
            state: ExecutorState::Active,
            core_concurrency: 0,
            max_concurrency: Limit::Unbounded,
            max_policy: MaxPolicy::Loose,
            max_queue_size: Limit::Unbounded,
            max_wait_for_enqueue: Duration::ZERO,
            queue_full_action: QueueFullAction::Abort,
            start_timeout: None,
            queue: VecDeque::new(),
            workers: 0,
            expedited_workers: 0,
            caller_permits: 0,
            running: BTreeMap::new(),
            concurrency_callback: None,
            late_start_callback: None,
            queue_size_callback: None,
        }
    }

    fn permits_in_use(&self) -> usize {
        self.workers + self.caller_permits
    }

    fn has_headroom(&self) -> bool {
        self.max_concurrency.admits(self.permits_in_use())
    }

    /// Claims a worker slot; returns whether the worker is expedited.
    fn take_worker(&mut self) -> bool {
        self.workers += 1;
        let expedite = self.expedited_workers < self.core_concurrency;
        if expedite {
            self.expedited_workers += 1;
        }
        expedite
    }

    fn release_worker(&mut self, expedite: bool) {
        self.workers = self.workers.saturating_sub(1);
        if expedite {
            self.expedited_workers = self.expedited_workers.saturating_sub(1);
        }
    }

    fn queue_capacity_remaining(&self) -> Option<usize> {
        if self.state.is_shutdown() {
            return Some(0);
        }
        self.max_queue_size.remaining(self.queue.len())
    }

    fn config(&self) -> PolicyConfig {
        PolicyConfig {
            core_concurrency: self.core_concurrency,
            max_concurrency: self.max_concurrency.get(),
            max_policy: self.max_policy,
            max_queue_size: self.max_queue_size.get(),
            max_wait_for_enqueue_millis: duration_millis(self.max_wait_for_enqueue),
            queue_full_action: self.queue_full_action,
            start_timeout_millis: self.start_timeout.map(duration_millis),
        }
    }

    fn take_concurrency_callback(&mut self) -> Option<ThresholdCallback> {
        let running = self.running.len();
        self.concurrency_callback
            .take_if(|threshold| running > threshold.limit)
            .map(|threshold| threshold.callback)
    }

    fn take_late_start_callback(&mut self, delay: Duration) -> Option<ThresholdCallback> {
        self.late_start_callback
            .take_if(|threshold| delay > threshold.limit)
            .map(|threshold| threshold.callback)
    }

    fn take_queue_size_callback(&mut self) -> Option<ThresholdCallback> {
        let remaining = self.max_queue_size.remaining(self.queue.len());
        self.queue_size_callback
            .take_if(|threshold| remaining.is_some_and(|remaining| remaining < threshold.limit))
            .map(|threshold| threshold.callback)
    }
}

struct Dispatch {
    task: QueuedTask,
    expedite: bool,
}

enum AdmitDecision {
    Accepted {
        dispatches: Vec<Dispatch>,
        timer: Option<Instant>,
        callback: Option<ThresholdCallback>,
    },
    Discarded(QueuedTask),
    Closed(QueuedTask),
    Full(QueuedTask),
}

/// What to do once the queue stays full for the whole enqueue wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FullQueue {
    Configured,
    /// Run on the submitter, whose concurrency is already accounted for.
    CallerRuns,
    Reject,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSnapshot {
    pub identifier: String,
    pub owner: Option<String>,
    pub state: ExecutorState,
    pub config: PolicyConfig,
    pub dispatched_workers: usize,
    pub expedited_workers: usize,
    pub caller_permits: usize,
    pub running_tasks: usize,
    pub queued_tasks: usize,
    pub queue_capacity_remaining: Option<usize>,
}

impl PolicyExecutor {
    /// Standalone executor that is not tracked by any provider.
    pub fn new(identifier: impl Into<String>, pool: Arc<dyn BackingPool>) -> Self {
        Self::build(identifier.into(), None, pool, None)
    }

    pub(crate) fn build(
        identifier: String,
        owner: Option<String>,
        pool: Arc<dyn BackingPool>,
        registry: Option<Weak<Registry>>,
    ) -> Self {
        let (lifecycle, _) = watch::channel(ExecutorState::Active);
        Self {
            shared: Arc::new(ExecutorShared {
                identifier: Arc::from(identifier),
                owner,
                pool,
                registry,
                inner: Mutex::new(ExecutorInner::new()),
                lifecycle,
                queue_space: Notify::new(),
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<ExecutorShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    pub fn owner(&self) -> Option<&str> {
        self.shared.owner.as_deref()
    }

    pub fn state(&self) -> ExecutorState {
        self.lock_inner().state
    }

    pub fn is_shutdown(&self) -> bool {
        self.state().is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ExecutorState::ShutDown
    }

    pub fn config(&self) -> PolicyConfig {
        self.lock_inner().config()
    }

    // Configuration. Every setter fails once shutdown has begun and only affects
    // decisions made after it returns.

    pub fn core_concurrency(&self, core: usize) -> PolicyResult<&Self> {
        self.reconfigure("coreConcurrency", |inner| {
            if !inner.max_concurrency.at_least(core) {
                return Err(invalid(format!(
                    "coreConcurrency {core} exceeds maxConcurrency {}",
                    inner.max_concurrency
                )));
            }
            inner.core_concurrency = core;
            Ok(())
        })
    }

    pub fn max_concurrency(&self, max: Limit) -> PolicyResult<&Self> {
        let max = self.with_identifier(max.validate("maxConcurrency"))?;
        self.reconfigure("maxConcurrency", |inner| {
            if !max.at_least(inner.core_concurrency) {
                return Err(invalid(format!(
                    "maxConcurrency {max} is below coreConcurrency {}",
                    inner.core_concurrency
                )));
            }
            inner.max_concurrency = max;
            Ok(())
        })
    }

    pub fn max_policy(&self, policy: MaxPolicy) -> PolicyResult<&Self> {
        self.reconfigure("maxPolicy", |inner| {
            inner.max_policy = policy;
            Ok(())
        })
    }

    pub fn max_queue_size(&self, max: Limit) -> PolicyResult<&Self> {
        let max = self.with_identifier(max.validate("maxQueueSize"))?;
        self.reconfigure("maxQueueSize", |inner| {
            inner.max_queue_size = max;
            Ok(())
        })
    }

    pub fn max_wait_for_enqueue(&self, wait: Duration) -> PolicyResult<&Self> {
        self.reconfigure("maxWaitForEnqueue", |inner| {
            inner.max_wait_for_enqueue = wait;
            Ok(())
        })
    }

    pub fn queue_full_action(&self, action: QueueFullAction) -> PolicyResult<&Self> {
        self.reconfigure("queueFullAction", |inner| {
            inner.queue_full_action = action;
            Ok(())
        })
    }

    pub fn start_timeout(&self, timeout: Option<Duration>) -> PolicyResult<&Self> {
        self.reconfigure("startTimeout", |inner| {
            inner.start_timeout = timeout;
            Ok(())
        })
    }

    /// Applies a whole configuration at once, or nothing if it is invalid.
    pub fn update_config(&self, config: &PolicyConfig) -> PolicyResult<&Self> {
        self.with_identifier(config.validate())?;
        self.reconfigure("configuration", |inner| {
            inner.core_concurrency = config.core_concurrency;
            inner.max_concurrency = config.max_concurrency_limit();
            inner.max_policy = config.max_policy;
            inner.max_queue_size = config.max_queue_size_limit();
            inner.max_wait_for_enqueue = config.max_wait_for_enqueue();
            inner.queue_full_action = config.queue_full_action;
            inner.start_timeout = config.start_timeout();
            Ok(())
        })
    }

    fn reconfigure(
        &self,
        setting: &str,
        apply: impl FnOnce(&mut ExecutorInner) -> PolicyResult<()>,
    ) -> PolicyResult<&Self> {
        let (dispatches, callback) = {
            let mut inner = self.lock_inner();
            if inner.state.is_shutdown() {
                return Err(self.error(
                    PolicyErrorKind::IllegalState,
                    format!("cannot change {setting} after shutdown"),
                ));
            }
            self.with_identifier(apply(&mut inner))?;
            (self.dispatch_locked(&mut inner), inner.take_queue_size_callback())
        };
        tracing::debug!(executor = %self.shared.identifier, setting, "policy updated");
        self.shared.queue_space.notify_waiters();
        self.launch(dispatches);
        self.fire_threshold(callback);
        Ok(self)
    }

    // Threshold callbacks. Each fires at most once and is then unregistered. They
    // run on the backing pool, never on the thread that crossed the threshold.

    /// Fires when more than `max` tasks are running. Returns the replaced callback.
    pub fn register_concurrency_callback(
        &self,
        max: usize,
        callback: Option<ThresholdCallback>,
    ) -> PolicyResult<Option<ThresholdCallback>> {
        let (previous, fire) = {
            let mut inner = self.lock_inner();
            self.ensure_active(&inner, "concurrency callback")?;
            let previous = std::mem::replace(
                &mut inner.concurrency_callback,
                callback.map(|callback| Threshold {
                    limit: max,
                    callback,
                }),
            );
            (previous, inner.take_concurrency_callback())
        };
        self.fire_threshold(fire);
        Ok(previous.map(|threshold| threshold.callback))
    }

    /// Fires when a task starts more than `max_delay` after it was submitted.
    pub fn register_late_start_callback(
        &self,
        max_delay: Duration,
        callback: Option<ThresholdCallback>,
    ) -> PolicyResult<Option<ThresholdCallback>> {
        let mut inner = self.lock_inner();
        self.ensure_active(&inner, "late start callback")?;
        let previous = std::mem::replace(
            &mut inner.late_start_callback,
            callback.map(|callback| Threshold {
                limit: max_delay,
                callback,
            }),
        );
        Ok(previous.map(|threshold| threshold.callback))
    }

    /// Fires when the remaining queue capacity drops below `min_capacity`.
    pub fn register_queue_size_callback(
        &self,
        min_capacity: usize,
        callback: Option<ThresholdCallback>,
    ) -> PolicyResult<Option<ThresholdCallback>> {
        let (previous, fire) = {
            let mut inner = self.lock_inner();
            self.ensure_active(&inner, "queue size callback")?;
            let previous = std::mem::replace(
                &mut inner.queue_size_callback,
                callback.map(|callback| Threshold {
                    limit: min_capacity,
                    callback,
                }),
            );
            (previous, inner.take_queue_size_callback())
        };
        self.fire_threshold(fire);
        Ok(previous.map(|threshold| threshold.callback))
    }

    fn fire_threshold(&self, callback: Option<ThresholdCallback>) {
        let Some(callback) = callback else {
            return;
        };
        let identifier = self.shared.identifier.clone();
        let job: PoolJob = Box::pin(async move {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                tracing::error!(executor = %identifier, "threshold callback panicked");
            }
        });
        if let Err(error) = self.shared.pool.execute(job, false) {
            tracing::warn!(
                executor = %self.shared.identifier,
                message = %error.message,
                "backing pool refused threshold callback"
            );
        }
    }

    // Submission.

    pub async fn execute<F, Fut, E>(&self, task: F) -> PolicyResult<()>
    where
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        self.submit_inner(task, None).await.map(|_| ())
    }

    pub async fn submit<T, F, Fut, E>(&self, task: F) -> PolicyResult<TaskFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        self.submit_inner(task, None).await
    }

    pub async fn submit_with_callback<T, F, Fut, E>(
        &self,
        task: F,
        callback: Arc<dyn TaskCallback>,
    ) -> PolicyResult<TaskFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        self.submit_inner(task, Some(callback)).await
    }

    async fn submit_inner<T, F, Fut, E>(
        &self,
        task: F,
        callback: Option<Arc<dyn TaskCallback>>,
    ) -> PolicyResult<TaskFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        let (future, task) = self.prepare(task, callback, None)?;
        let max_wait = self.lock_inner().max_wait_for_enqueue;
        self.admit(task, max_wait, FullQueue::Configured).await?;
        Ok(future)
    }

    /// Creates the task and runs `on_submit`.
    pub(crate) fn prepare<T, F, Fut, E>(
        &self,
        task: F,
        callback: Option<Arc<dyn TaskCallback>>,
        group: Option<Arc<InvokeAnyGroup>>,
    ) -> PolicyResult<(TaskFuture<T>, QueuedTask)>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        let configured = {
            let inner = self.lock_inner();
            if !inner.state.accepts_submissions() {
                return Err(self.shutdown_error());
            }
            inner.start_timeout
        };
        let start_timeout = match &callback {
            Some(callback) => catch_unwind(AssertUnwindSafe(|| callback.start_timeout(configured)))
                .unwrap_or_else(|_| {
                    tracing::error!(
                        executor = %self.shared.identifier,
                        "start_timeout callback panicked"
                    );
                    configured
                }),
            None => configured,
        };

        let handle = TaskHandle::new(TaskCoreInit {
            id: TaskId(self.shared.next_task_id.fetch_add(1, Ordering::Relaxed)),
            executor_identifier: self.shared.identifier.clone(),
            executor_key: self.key(),
            executor: Arc::downgrade(&self.shared),
            callback: callback.clone(),
            start_timeout,
            group: group.clone(),
        });
        let slot = Arc::new(Mutex::new(None));
        let body = wrap_body(task, slot.clone());

        if let Some(callback) = callback {
            let count = group.as_ref().map(|group| group.remaining());
            let submitted = guarded("on_submit", &handle, || callback.on_submit(&handle, count))
                .and_then(|result| result);
            if let Err(failure) = submitted {
                let error = self
                    .error(
                        PolicyErrorKind::Rejected,
                        format!("task rejected by on_submit: {failure}"),
                    )
                    .for_task(handle.id());
                handle.abort(error.clone(), false);
                return Err(error);
            }
        }

        Ok((
            TaskFuture::new(handle.clone(), slot),
            QueuedTask { handle, body },
        ))
    }

    /// Gets a prepared task queued, dispatched or run on the caller.
    pub(crate) async fn admit(
        &self,
        task: QueuedTask,
        max_wait: Duration,
        full: FullQueue,
    ) -> PolicyResult<()> {
        let handle = task.handle.clone();
        let deadline = Instant::now().checked_add(max_wait);
        let mut pending = PendingAdmission {
            executor: self,
            task: Some(task),
        };

        loop {
            let notified = self.shared.queue_space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(task) = pending.task.take() else {
                return Err(self.error(PolicyErrorKind::Internal, "admission lost its task"));
            };
            match self.try_admit(task) {
                AdmitDecision::Accepted {
                    dispatches,
                    timer,
                    callback,
                } => {
                    handle.mark_accepted();
                    tracing::debug!(
                        executor = %self.shared.identifier,
                        task_id = handle.id().0,
                        dispatched = !dispatches.is_empty(),
                        "task accepted"
                    );
                    self.launch(dispatches);
                    if let Some(deadline) = timer {
                        self.schedule_start_timeout(&handle, deadline);
                    }
                    self.fire_threshold(callback);
                    return Ok(());
                }
                AdmitDecision::Discarded(task) => {
                    self.discard(&task.handle);
                    return Ok(());
                }
                AdmitDecision::Closed(task) => {
                    return Err(self.reject(&task.handle, self.shutdown_error()));
                }
                AdmitDecision::Full(task) => {
                    let remaining =
                        deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
                    if remaining.is_some_and(|remaining| remaining.is_zero()) {
                        return self.queue_full(task, full, max_wait).await;
                    }
                    pending.task = Some(task);
                    match remaining {
                        Some(remaining) => {
                            let _ = tokio::time::timeout(remaining, notified).await;
                        }
                        None => notified.await,
                    }
                }
            }
        }
    }

    fn try_admit(&self, task: QueuedTask) -> AdmitDecision {
        let mut inner = self.lock_inner();
        if task.handle.state() != TaskState::Presubmit {
            return AdmitDecision::Discarded(task);
        }
        if !inner.state.accepts_submissions() {
            return AdmitDecision::Closed(task);
        }
        if inner.queue.is_empty() && inner.has_headroom() {
            task.handle.transition(&[TaskState::Presubmit], TaskState::Submitted);
            let expedite = inner.take_worker();
            return AdmitDecision::Accepted {
                dispatches: vec![Dispatch { task, expedite }],
                timer: None,
                callback: None,
            };
        }
        if !inner.max_queue_size.admits(inner.queue.len()) {
            return AdmitDecision::Full(task);
        }
        task.handle.transition(&[TaskState::Presubmit], TaskState::Submitted);
        let timer = task.handle.start_deadline();
        inner.queue.push_back(task);
        AdmitDecision::Accepted {
            dispatches: self.dispatch_locked(&mut inner),
            timer,
            callback: inner.take_queue_size_callback(),
        }
    }

    async fn queue_full(
        &self,
        task: QueuedTask,
        full: FullQueue,
        waited: Duration,
    ) -> PolicyResult<()> {
        let (action, policy, max_queue) = {
            let inner = self.lock_inner();
            (inner.queue_full_action, inner.max_policy, inner.max_queue_size)
        };
        let (run_on_caller, needs_permit) = match full {
            FullQueue::CallerRuns => (true, false),
            FullQueue::Reject => (false, false),
            FullQueue::Configured => {
                let run = match action {
                    QueueFullAction::Abort => false,
                    QueueFullAction::CallerRuns => true,
                    QueueFullAction::CallerRunsIfSameExecutor => {
                        current_scope().is_some_and(|scope| scope.executor == self.key())
                    }
                };
                (run, policy == MaxPolicy::Strict)
            }
        };

        if !run_on_caller {
            let error = self.error(
                PolicyErrorKind::Rejected,
                format!("queue is at capacity {max_queue} after waiting {waited:?} for a slot"),
            );
            return Err(self.reject(&task.handle, error));
        }
        if task.handle.start_deadline_passed(Instant::now()) {
            let error = self.start_timeout_error(&task.handle);
            return Err(self.reject(&task.handle, error));
        }

        let permit = if needs_permit {
            match self.try_caller_permit() {
                Some(permit) => Some(permit),
                None => {
                    let error = self.error(
                        PolicyErrorKind::Rejected,
                        "queue is full and no concurrency is left to run the task on the submitter",
                    );
                    return Err(self.reject(&task.handle, error));
                }
            }
        } else {
            None
        };
        let result = self.run_on_caller(task).await;
        drop(permit);
        result
    }

    /// Runs a prepared task inline on the calling task.
    pub(crate) async fn run_on_caller(&self, task: QueuedTask) -> PolicyResult<()> {
        {
            let inner = self.lock_inner();
            if task.handle.state() == TaskState::Presubmit && !inner.state.accepts_submissions()
            {
                drop(inner);
                return Err(self.reject(&task.handle, self.shutdown_error()));
            }
        }
        if !task
            .handle
            .transition(&[TaskState::Presubmit], TaskState::Submitted)
        {
            self.discard(&task.handle);
            return Ok(());
        }
        task.handle.mark_accepted();
        tracing::debug!(
            executor = %self.shared.identifier,
            task_id = task.handle.id().0,
            "running task on the submitter"
        );
        self.run_task(task).await;
        Ok(())
    }

    pub(crate) fn try_caller_permit(&self) -> Option<CallerPermit<'_>> {
        let mut inner = self.lock_inner();
        if inner.state.accepts_submissions() && inner.has_headroom() {
            inner.caller_permits += 1;
            Some(CallerPermit { executor: self })
        } else {
            None
        }
    }

    pub(crate) fn max_policy_now(&self) -> MaxPolicy {
        self.lock_inner().max_policy
    }

    pub(crate) fn max_wait_now(&self) -> Duration {
        self.lock_inner().max_wait_for_enqueue
    }

    pub(crate) fn ensure_accepting(&self) -> PolicyResult<()> {
        if self.lock_inner().state.accepts_submissions() {
            Ok(())
        } else {
            Err(self.shutdown_error())
        }
    }

    /// Takes a still-queued task back so the caller can run it inline.
    pub(crate) fn reclaim_queued(&self, id: TaskId) -> Option<QueuedTask> {
        let task = {
            let mut inner = self.lock_inner();
            if !inner.state.can_start_tasks() {
                return None;
            }
            let position = inner.queue.iter().position(|task| task.handle.id() == id)?;
            inner.queue.remove(position)
        };
        self.shared.queue_space.notify_waiters();
        task
    }

    /// Removes a cancelled task from the queue. Returns whether it was still queued.
    pub(crate) fn remove_queued(&self, id: TaskId) -> bool {
        let (removed, terminated) = {
            let mut inner = self.lock_inner();
            let removed = match inner.queue.iter().position(|task| task.handle.id() == id) {
                Some(position) => inner.queue.remove(position).is_some(),
                None => false,
            };
            (removed, self.check_terminated(&mut inner))
        };
        if removed {
            self.shared.queue_space.notify_waiters();
        }
        if terminated {
            self.on_terminated();
        }
        removed
    }

    /// Arms the start timeout of a queued task. The timer stops as soon as the task
    /// leaves `Submitted`, whether it started, was cancelled or expired.
    fn schedule_start_timeout(&self, handle: &TaskHandle, deadline: Instant) {
        let shared = Arc::downgrade(&self.shared);
        let id = handle.id();
        let mut state = handle.subscribe_state();
        let job: PoolJob = Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                _ = async {
                    let _ = state.wait_for(|state| *state != TaskState::Submitted).await;
                } => return,
            }
            if let Some(shared) = shared.upgrade() {
                PolicyExecutor::from_shared(shared).expire_queued(id);
            }
        });
        if let Err(error) = self.shared.pool.execute_timer(job) {
            tracing::warn!(
                executor = %self.shared.identifier,
                task_id = id.0,
                message = %error.message,
                "backing pool refused start timeout timer"
            );
        }
    }

    fn expire_queued(&self, id: TaskId) {
        let (task, terminated) = {
            let mut inner = self.lock_inner();
            let task = inner
                .queue
                .iter()
                .position(|task| task.handle.id() == id)
                .and_then(|position| inner.queue.remove(position));
            (task, self.check_terminated(&mut inner))
        };
        if let Some(task) = task {
            self.shared.queue_space.notify_waiters();
            task.handle
                .abort(self.start_timeout_error(&task.handle), true);
        }
        if terminated {
            self.on_terminated();
        }
    }

    // Dispatch.

    fn dispatch_locked(&self, inner: &mut ExecutorInner) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        while inner.state.can_start_tasks() && inner.has_headroom() {
            let Some(task) = inner.queue.pop_front() else {
                break;
            };
            let expedite = inner.take_worker();
            dispatches.push(Dispatch { task, expedite });
        }
        dispatches
    }

    fn launch(&self, dispatches: Vec<Dispatch>) {
        if dispatches.is_empty() {
            return;
        }
        self.shared.queue_space.notify_waiters();
        for Dispatch { task, expedite } in dispatches {
            let handle = task.handle.clone();
            let job: PoolJob = Box::pin(self.clone().worker(task, expedite));
            if let Err(error) = self.shared.pool.execute(job, expedite) {
                tracing::error!(
                    executor = %self.shared.identifier,
                    task_id = handle.id().0,
                    message = %error.message,
                    "backing pool rejected task"
                );
                self.finish_worker(expedite);
                handle.abort(
                    self.error(
                        PolicyErrorKind::Rejected,
                        format!("backing pool rejected task: {}", error.message),
                    ),
                    false,
                );
            }
        }
    }

    async fn worker(self, task: QueuedTask, expedite: bool) {
        self.run_task(task).await;
        self.finish_worker(expedite);
    }

    /// Gives a worker slot back and hands freed concurrency to queued tasks.
    fn finish_worker(&self, expedite: bool) {
        let (dispatches, terminated) = {
            let mut inner = self.lock_inner();
            inner.release_worker(expedite);
            let dispatches = self.dispatch_locked(&mut inner);
            (dispatches, self.check_terminated(&mut inner))
        };
        self.launch(dispatches);
        if terminated {
            self.on_terminated();
        }
    }

    pub(crate) async fn run_task(&self, task: QueuedTask) {
        let scope = task.handle.scope();
        with_task_scope(scope, self.run_in_scope(task)).await;
    }

    async fn run_in_scope(&self, task: QueuedTask) {
        let QueuedTask { handle, body } = task;
        handle.mark_started();
        if handle.state() != TaskState::Submitted {
            handle.mark_ended();
            handle.fire_on_end(None, true, 0, None);
            return;
        }
        if handle.start_deadline_passed(Instant::now()) {
            handle.abort(self.start_timeout_error(&handle), true);
            return;
        }

        let _running = RunningGuard::enter(self, &handle);
        if !self.state().can_start_tasks() {
            handle.cancel(false);
            handle.fire_on_end(None, true, 0, None);
            return;
        }

        let start: Option<StartContext> = match handle.callback() {
            Some(callback) => {
                handle.set_starting(true);
                let started = guarded("on_start", &handle, || callback.on_start(&handle))
                    .and_then(|result| result);
                handle.set_starting(false);
                match started {
                    Ok(start) => start,
                    Err(failure) => {
                        let aborted = handle.abort(
                            self.error(
                                PolicyErrorKind::Rejected,
                                format!("task start rejected by on_start: {failure}"),
                            ),
                            false,
                        );
                        if !aborted {
                            handle.fire_on_end(None, true, 0, None);
                        }
                        return;
                    }
                }
            }
            None => None,
        };
        if !handle.transition(&[TaskState::Submitted], TaskState::Running) {
            handle.mark_ended();
            let failure = (handle.state() == TaskState::Aborted)
                .then(|| handle.abort_cause())
                .flatten()
                .map(|cause| -> TaskFailure { Arc::new(cause) });
            handle.fire_on_end(start.as_ref(), true, 0, failure.as_ref());
            return;
        }

        let token = handle.token().clone();
        let body = body(token.clone());
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = AssertUnwindSafe(body).catch_unwind() => Some(outcome),
        };
        let failure = match outcome {
            Some(Ok(BodyOutcome::Completed)) => {
                handle.complete(None);
                None
            }
            Some(Ok(BodyOutcome::Failed(failure))) => {
                handle.complete(Some(failure.clone()));
                Some(failure)
            }
            Some(Err(payload)) => {
                let failure: TaskFailure = Arc::new(TaskPanicked::from_payload(payload));
                tracing::warn!(
                    executor = %self.shared.identifier,
                    task_id = handle.id().0,
                    message = %failure,
                    "task body panicked"
                );
                handle.complete(Some(failure.clone()));
                Some(failure)
            }
            None => {
                handle.settle_cancelled();
                None
            }
        };

        let release_hook = handle.callback().cloned().map(|callback| {
            let handle = handle.clone();
            let start = start.clone();
            Arc::new(move || {
                let _ = guarded("on_end", &handle, || {
                    callback.on_end(&handle, start.as_ref(), false, -1, None)
                });
            }) as Arc<dyn Fn() + Send + Sync>
        });
        let pending = token.seal_pending(release_hook);
        handle.fire_on_end(
            start.as_ref(),
            false,
            i32::try_from(pending).unwrap_or(i32::MAX),
            failure.as_ref(),
        );
    }

    // Lifecycle.

    /// Stops accepting tasks. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        let terminated = {
            let mut inner = self.lock_inner();
            if inner.state != ExecutorState::Active {
                return;
            }
            self.set_state(&mut inner, ExecutorState::ShuttingDown);
            inner.concurrency_callback = None;
            inner.late_start_callback = None;
            inner.queue_size_callback = None;
            self.check_terminated(&mut inner)
        };
        tracing::info!(executor = %self.shared.identifier, "policy executor shutting down");
        self.shared.queue_space.notify_waiters();
        if terminated {
            self.on_terminated();
        }
    }

    /// Shuts down, cancels queued tasks and interrupts running ones. Returns the
    /// queued tasks that were cancelled. Later calls return an empty list.
    pub fn shutdown_now(&self) -> Vec<TaskHandle> {
        self.shutdown();
        let (queued, running, terminated) = {
            let mut inner = self.lock_inner();
            if inner.state != ExecutorState::ShuttingDown {
                return Vec::new();
            }
            self.set_state(&mut inner, ExecutorState::TasksCancelled);
            let queued: Vec<QueuedTask> = inner.queue.drain(..).collect();
            let running: Vec<TaskHandle> = inner.running.values().cloned().collect();
            (queued, running, self.check_terminated(&mut inner))
        };
        let cancelled = self.cancel_drained(queued);
        for handle in &running {
            handle.cancel(true);
        }
        tracing::info!(
            executor = %self.shared.identifier,
            cancelled_queued = cancelled.len(),
            interrupted = running.len(),
            "policy executor stopped"
        );
        if terminated {
            self.on_terminated();
        }
        cancelled
    }

    /// Cancels every queued and running task without shutting down. Returns the
    /// number of tasks that were cancelled.
    pub fn cancel_all(&self, interrupt: bool) -> usize {
        let (queued, running) = {
            let mut inner = self.lock_inner();
            let queued: Vec<QueuedTask> = inner.queue.drain(..).collect();
            let running: Vec<TaskHandle> = inner.running.values().cloned().collect();
            (queued, running)
        };
        self.shared.queue_space.notify_waiters();
        let mut count = self.cancel_drained(queued).len();
        for handle in running {
            if handle.cancel(interrupt) {
                count += 1;
            }
        }
        count
    }

    fn cancel_drained(&self, queued: Vec<QueuedTask>) -> Vec<TaskHandle> {
        let mut cancelled = Vec::with_capacity(queued.len());
        for QueuedTask { handle, .. } in queued {
            if handle.cancel(false) {
                handle.fire_on_end(None, true, 0, None);
                cancelled.push(handle);
            }
        }
        cancelled
    }

    /// Waits until shutdown has completed. Returns false on timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut receiver = self.shared.lifecycle.subscribe();
        tokio::time::timeout(
            timeout,
            receiver.wait_for(|state| *state == ExecutorState::ShutDown),
        )
        .await
        .is_ok_and(|result| result.is_ok())
    }

    fn set_state(&self, inner: &mut ExecutorInner, state: ExecutorState) {
        inner.state = state;
        self.shared.lifecycle.send_replace(state);
    }

    fn check_terminated(&self, inner: &mut ExecutorInner) -> bool {
        let drained = matches!(
            inner.state,
            ExecutorState::ShuttingDown | ExecutorState::TasksCancelled
        ) && inner.queue.is_empty()
            && inner.permits_in_use() == 0
            && inner.running.is_empty();
        if drained {
            self.set_state(inner, ExecutorState::ShutDown);
        }
        drained
    }

    fn on_terminated(&self) {
        tracing::info!(executor = %self.shared.identifier, "policy executor terminated");
        let Some(registry) = self.shared.registry.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let mut executors = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if executors
            .get(self.identifier())
            .is_some_and(|registered| registered.same_instance(self))
        {
            executors.remove(self.identifier());
        }
    }

    // Introspection.

    pub fn running_task_count(&self) -> usize {
        self.lock_inner().running.len()
    }

    pub fn queued_task_count(&self) -> usize {
        self.lock_inner().queue.len()
    }

    /// `None` when the queue is unbounded.
    pub fn queue_capacity_remaining(&self) -> Option<usize> {
        self.lock_inner().queue_capacity_remaining()
    }

    pub fn snapshot(&self) -> ExecutorSnapshot {
        let inner = self.lock_inner();
        ExecutorSnapshot {
            identifier: self.shared.identifier.to_string(),
            owner: self.shared.owner.clone(),
            state: inner.state,
            config: inner.config(),
            dispatched_workers: inner.workers,
            expedited_workers: inner.expedited_workers,
            caller_permits: inner.caller_permits,
            running_tasks: inner.running.len(),
            queued_tasks: inner.queue.len(),
            queue_capacity_remaining: inner.queue_capacity_remaining(),
        }
    }

    /// Writes a human-readable dump of configuration, counters and tasks.
    pub fn introspect(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let (lines, running, queued, queued_total) = {
            let inner = self.lock_inner();
            let lines = vec![
                format!("owner = {}", self.owner().unwrap_or("none")),
                format!("state = {:?}", inner.state),
                format!("coreConcurrency = {}", inner.core_concurrency),
                format!(
                    "maxConcurrency = {} ({:?})",
                    inner.max_concurrency, inner.max_policy
                ),
                format!("maxQueueSize = {}", inner.max_queue_size),
                format!("maxWaitForEnqueue = {:?}", inner.max_wait_for_enqueue),
                format!("queueFullAction = {:?}", inner.queue_full_action),
                format!("startTimeout = {:?}", inner.start_timeout),
                format!(
                    "Total Dispatched to Backing Pool = {} ({} expedited)",
                    inner.workers, inner.expedited_workers
                ),
                format!("Caller Permits = {}", inner.caller_permits),
                format!(
                    "Remaining Queue Capacity = {}",
                    inner
                        .queue_capacity_remaining()
                        .map_or_else(|| "unbounded".to_string(), |value| value.to_string())
                ),
                format!(
                    "concurrency callback = {}",
                    threshold_label(&inner.concurrency_callback)
                ),
                format!(
                    "late start callback = {}",
                    threshold_label(&inner.late_start_callback)
                ),
                format!(
                    "queue capacity callback = {}",
                    threshold_label(&inner.queue_size_callback)
                ),
            ];
            let running: Vec<TaskHandle> = inner.running.values().cloned().collect();
            let queued: Vec<TaskHandle> = inner
                .queue
                .iter()
                .take(INTROSPECT_QUEUE_LIMIT)
                .map(|task| task.handle.clone())
                .collect();
            (lines, running, queued, inner.queue.len())
        };

        writeln!(out, "{}", self.shared.identifier)?;
        for line in lines {
            writeln!(out, "  {line}")?;
        }
        writeln!(out, "  Running Task Count = {}", running.len())?;
        writeln!(out, "  Running Task Futures:")?;
        write_tasks(out, &running)?;
        writeln!(out, "  Queued Task Count = {queued_total}")?;
        writeln!(out, "  Queued Task Futures (up to first {INTROSPECT_QUEUE_LIMIT}):")?;
        write_tasks(out, &queued)?;
        Ok(())
    }

    // Helpers.

    pub(crate) fn key(&self) -> ExecutorKey {
        ExecutorKey(Arc::as_ptr(&self.shared) as usize)
    }

    fn lock_inner(&self) -> MutexGuard<'_, ExecutorInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_active(&self, inner: &ExecutorInner, setting: &str) -> PolicyResult<()> {
        if inner.state.is_shutdown() {
            return Err(self.error(
                PolicyErrorKind::IllegalState,
                format!("cannot register {setting} after shutdown"),
            ));
        }
        Ok(())
    }

    pub(crate) fn error(&self, kind: PolicyErrorKind, message: impl Into<String>) -> PolicyError {
        PolicyError::new(kind, message).for_executor(&self.shared.identifier)
    }

    fn with_identifier<T>(&self, result: PolicyResult<T>) -> PolicyResult<T> {
        result.map_err(|error| error.for_executor(&self.shared.identifier))
    }

    fn shutdown_error(&self) -> PolicyError {
        self.error(PolicyErrorKind::Rejected, "executor is shut down")
    }

    fn start_timeout_error(&self, handle: &TaskHandle) -> PolicyError {
        self.error(
            PolicyErrorKind::StartTimeout,
            format!(
                "task {} did not start within its start timeout ({:?} since submission)",
                handle.id(),
                handle.elapsed_accept_time() + handle.elapsed_queue_time()
            ),
        )
    }

    /// Aborts a task that was refused and returns the error for the submitter.
    pub(crate) fn reject(&self, handle: &TaskHandle, error: PolicyError) -> PolicyError {
        let error = error.for_task(handle.id());
        handle.abort(error.clone(), false);
        tracing::debug!(
            executor = %self.shared.identifier,
            task_id = handle.id().0,
            message = %error.message,
            "task rejected"
        );
        error
    }

    /// Ends a task that was cancelled before it could be accepted.
    fn discard(&self, handle: &TaskHandle) {
        handle.mark_started();
        handle.mark_ended();
        handle.fire_on_end(None, true, 0, None);
    }
}

impl Debug for PolicyExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyExecutor")
            .field("identifier", &self.shared.identifier)
            .field("state", &self.state())
            .finish()
    }
}

fn invalid(message: String) -> PolicyError {
    PolicyError::new(PolicyErrorKind::InvalidInput, message)
}

fn threshold_label<V: Debug>(threshold: &Option<Threshold<V>>) -> String {
    threshold
        .as_ref()
        .map_or_else(|| "none".to_string(), |threshold| format!("{:?}", threshold.limit))
}

fn write_tasks(out: &mut dyn io::Write, tasks: &[TaskHandle]) -> io::Result<()> {
    if tasks.is_empty() {
        return writeln!(out, "    None");
    }
    for task in tasks {
        writeln!(out, "    {task}")?;
    }
    Ok(())
}

/// Concurrency slot held by a task running on its submitter under `MaxPolicy::Strict`.
pub(crate) struct CallerPermit<'a> {
    executor: &'a PolicyExecutor,
}

impl Drop for CallerPermit<'_> {
    fn drop(&mut self) {
        let executor = self.executor;
        let (dispatches, terminated) = {
            let mut inner = executor.lock_inner();
            inner.caller_permits = inner.caller_permits.saturating_sub(1);
            let dispatches = executor.dispatch_locked(&mut inner);
            (dispatches, executor.check_terminated(&mut inner))
        };
        executor.launch(dispatches);
        if terminated {
            executor.on_terminated();
        }
    }
}

/// Holds a task while its submission waits for queue space. Dropping the submission
/// mid-wait aborts the task.
struct PendingAdmission<'a> {
    executor: &'a PolicyExecutor,
    task: Option<QueuedTask>,
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let error = self.executor.error(
                PolicyErrorKind::Interrupted,
                "submission abandoned while waiting for queue space",
            );
            self.executor.reject(&task.handle, error);
        }
    }
}

/// Tracks a task in the running set for as long as it occupies a worker.
struct RunningGuard<'a> {
    executor: &'a PolicyExecutor,
    handle: TaskHandle,
}

impl<'a> RunningGuard<'a> {
    fn enter(executor: &'a PolicyExecutor, handle: &TaskHandle) -> Self {
        let fired = {
            let mut inner = executor.lock_inner();
            inner.running.insert(handle.id(), handle.clone());
            [
                inner.take_concurrency_callback(),
                inner.take_late_start_callback(handle.queue_delay()),
            ]
        };
        for callback in fired {
            executor.fire_threshold(callback);
        }
        Self {
            executor,
            handle: handle.clone(),
        }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if !self.handle.is_done() {
            // Dropped mid-run, e.g. a caller-run submission that was abandoned.
            self.handle.cancel(true);
            self.handle.mark_ended();
            self.handle.fire_on_end(None, false, 0, None);
        }
        let executor = self.executor;
        let terminated = {
            let mut inner = executor.lock_inner();
            inner.running.remove(&self.handle.id());
            executor.check_terminated(&mut inner)
        };
        if terminated {
            executor.on_terminated();
        }
    }
}
