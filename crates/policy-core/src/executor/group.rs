use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::executor::callback::TaskCallback;
use crate::executor::future::QueuedTask;
use crate::executor::policy_executor::{CallerPermit, FullQueue};
use crate::executor::{PolicyExecutor, PolicyResult, TaskCancellationToken, TaskFuture, TaskHandle};
use crate::models::{MaxPolicy, PolicyError, PolicyErrorKind, TaskError, TaskId, TaskState};

/// Completion latch shared by the tasks of one `invoke_any` call.
pub(crate) struct InvokeAnyGroup {
    size: usize,
    finished: AtomicUsize,
    last_finished: Mutex<Option<TaskId>>,
    notify: Notify,
}

impl InvokeAnyGroup {
    fn new(size: usize) -> Self {
        Self {
            size,
            finished: AtomicUsize::new(0),
            last_finished: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.size.saturating_sub(self.finished.load(Ordering::SeqCst))
    }

    pub(crate) fn task_finished(&self, task: TaskId) {
        *self
            .last_finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn last_finished(&self) -> Option<TaskId> {
        *self
            .last_finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancels every task of a group that has not finished when dropped.
struct CancelUnfinished {
    handles: Vec<TaskHandle>,
    armed: bool,
}

impl CancelUnfinished {
    fn new<T>(futures: &[TaskFuture<T>]) -> Self {
        Self {
            handles: futures.iter().map(|future| future.handle().clone()).collect(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelUnfinished {
    fn drop(&mut self) {
        if self.armed {
            for handle in &self.handles {
                handle.cancel(true);
            }
        }
    }
}

impl PolicyExecutor {
    /// Submits every task and waits for all of them. The last task, and any task still
    /// queued afterwards, run on the caller when the max policy allows it.
    pub async fn invoke_all<T, F, Fut, E>(
        &self,
        tasks: impl IntoIterator<Item = F>,
    ) -> PolicyResult<Vec<TaskFuture<T>>>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        self.invoke_all_with_callback(tasks, None).await
    }

    pub async fn invoke_all_with_callback<T, F, Fut, E>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        callback: Option<Arc<dyn TaskCallback>>,
    ) -> PolicyResult<Vec<TaskFuture<T>>>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        let tasks: Vec<F> = tasks.into_iter().collect();
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_accepting()?;

        let (run_inline, permit) = self.caller_slot();
        let (futures, prepared) = self.prepare_all(tasks, callback, None)?;
        let mut guard = CancelUnfinished::new(&futures);

        let (wait, full) = if run_inline {
            (Duration::ZERO, FullQueue::CallerRuns)
        } else {
            (self.max_wait_now(), FullQueue::Configured)
        };
        let mut held_back = None;
        let last = prepared.len() - 1;
        let mut pending = prepared.into_iter().enumerate();
        while let Some((index, task)) = pending.next() {
            if run_inline && index == last {
                held_back = Some(task);
                break;
            }
            if let Err(error) = self.admit(task, wait, full).await {
                abort_remaining(pending.map(|(_, task)| task), &error);
                return Err(error);
            }
        }

        if let Some(task) = held_back {
            self.run_on_caller(task).await?;
            for future in futures.iter().rev().skip(1) {
                if let Some(task) = self.reclaim_queued(future.id()) {
                    self.run_task(task).await;
                }
            }
        }
        for future in &futures {
            future.await_state(None).await;
        }
        drop(permit);
        guard.disarm();
        Ok(futures)
    }

    /// Like `invoke_all`, but never runs tasks on the caller. Tasks not finished when
    /// `timeout` elapses are cancelled.
    pub async fn invoke_all_timed<T, F, Fut, E>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        timeout: Duration,
    ) -> PolicyResult<Vec<TaskFuture<T>>>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        let deadline = Instant::now().checked_add(timeout);
        let tasks: Vec<F> = tasks.into_iter().collect();
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let (futures, prepared) = self.prepare_all(tasks, None, None)?;
        let _guard = CancelUnfinished::new(&futures);

        let max_wait = self.max_wait_now();
        let mut pending = prepared.into_iter();
        while let Some(task) = pending.next() {
            let remaining = remaining_until(deadline);
            let admitted = if remaining.is_zero() {
                Err(self.reject(
                    &task.handle,
                    self.error(
                        PolicyErrorKind::Timeout,
                        format!("could not submit every task within {timeout:?}"),
                    ),
                ))
            } else {
                self.admit(task, remaining.min(max_wait), FullQueue::Reject)
                    .await
            };
            if let Err(error) = admitted {
                abort_remaining(pending, &error);
                return Err(error);
            }
        }

        for future in &futures {
            let remaining = remaining_until(deadline);
            if remaining.is_zero() {
                break;
            }
            future.await_state(Some(remaining)).await;
        }
        Ok(futures)
    }

    /// Returns the result of the first task to succeed and cancels the others. Fails
    /// with the last task's error if none succeeds.
    pub async fn invoke_any<T, F, Fut, E>(
        &self,
        tasks: impl IntoIterator<Item = F>,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        self.invoke_any_inner(tasks, None, None).await
    }

    pub async fn invoke_any_with_callback<T, F, Fut, E>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        callback: Arc<dyn TaskCallback>,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        self.invoke_any_inner(tasks, Some(callback), None).await
    }

    pub async fn invoke_any_timed<T, F, Fut, E>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        timeout: Duration,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        self.invoke_any_inner(tasks, None, Some(timeout)).await
    }

    async fn invoke_any_inner<T, F, Fut, E>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        callback: Option<Arc<dyn TaskCallback>>,
        timeout: Option<Duration>,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let tasks: Vec<F> = tasks.into_iter().collect();
        if tasks.is_empty() {
            return Err(TaskError::Aborted(self.error(
                PolicyErrorKind::InvalidInput,
                "invoke_any needs at least one task",
            )));
        }
        self.ensure_accepting().map_err(TaskError::Aborted)?;

        let group = Arc::new(InvokeAnyGroup::new(tasks.len()));
        if tasks.len() == 1 && timeout.is_none() {
            return self.invoke_single(tasks, callback, group).await;
        }

        let (futures, prepared) = self
            .prepare_all(tasks, callback, Some(group.clone()))
            .map_err(TaskError::Aborted)?;
        let _guard = CancelUnfinished::new(&futures);

        let max_wait = self.max_wait_now();
        let mut admitted = 0;
        let mut pending = prepared.into_iter();
        while let Some(task) = pending.next() {
            if futures.iter().any(|future| future.state() == TaskState::Success) {
                abort_remaining(
                    std::iter::once(task).chain(pending.by_ref()),
                    &self.error(PolicyErrorKind::Interrupted, "another task already succeeded"),
                );
                break;
            }
            let wait = remaining_until(deadline).min(max_wait);
            match self.admit(task, wait, FullQueue::Reject).await {
                Ok(()) => admitted += 1,
                Err(error) if admitted == 0 => {
                    abort_remaining(pending, &error);
                    return Err(TaskError::Aborted(error));
                }
                Err(error) => {
                    tracing::debug!(
                        executor = self.identifier(),
                        message = %error.message,
                        "invoke_any continues with the tasks already submitted"
                    );
                    abort_remaining(pending, &error);
                    break;
                }
            }
        }

        loop {
            let notified = group.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            for future in &futures {
                if future.state() == TaskState::Success
                    && let Some(value) = future.take_value()
                {
                    return Ok(value);
                }
            }
            if group.remaining() == 0 {
                return Err(last_failure(&futures, group.last_finished()));
            }

            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return Err(TaskError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// A lone `invoke_any` task runs on the caller when the max policy allows it.
    async fn invoke_single<T, F, Fut, E>(
        &self,
        tasks: Vec<F>,
        callback: Option<Arc<dyn TaskCallback>>,
        group: Arc<InvokeAnyGroup>,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        let (run_inline, permit) = self.caller_slot();
        let (mut futures, mut prepared) = self
            .prepare_all(tasks, callback, Some(group))
            .map_err(TaskError::Aborted)?;
        let (Some(future), Some(task)) = (futures.pop(), prepared.pop()) else {
            return Err(TaskError::Aborted(self.error(
                PolicyErrorKind::Internal,
                "invoke_any lost its only task",
            )));
        };
        let submitted = if run_inline {
            self.run_on_caller(task).await
        } else {
            self.admit(task, self.max_wait_now(), FullQueue::Configured)
                .await
        };
        drop(permit);
        submitted.map_err(TaskError::Aborted)?;
        future.join().await
    }

    /// Whether group tasks may run on the caller, with the permit that allows it under
    /// `MaxPolicy::Strict`.
    fn caller_slot(&self) -> (bool, Option<CallerPermit<'_>>) {
        match self.max_policy_now() {
            MaxPolicy::Loose => (true, None),
            MaxPolicy::Strict => {
                let permit = self.try_caller_permit();
                (permit.is_some(), permit)
            }
        }
    }

    fn prepare_all<T, F, Fut, E>(
        &self,
        tasks: Vec<F>,
        callback: Option<Arc<dyn TaskCallback>>,
        group: Option<Arc<InvokeAnyGroup>>,
    ) -> PolicyResult<(Vec<TaskFuture<T>>, Vec<QueuedTask>)>
    where
        T: Send + 'static,
        F: FnOnce(TaskCancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    {
        let mut futures = Vec::with_capacity(tasks.len());
        let mut prepared = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.prepare(task, callback.clone(), group.clone()) {
                Ok((future, task)) => {
                    futures.push(future);
                    prepared.push(task);
                }
                Err(error) => {
                    abort_remaining(prepared, &error);
                    return Err(error);
                }
            }
        }
        Ok((futures, prepared))
    }
}

/// Time left until `deadline`; no deadline means no limit.
fn remaining_until(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |deadline| {
        deadline.saturating_duration_since(Instant::now())
    })
}

fn abort_remaining(tasks: impl IntoIterator<Item = QueuedTask>, cause: &PolicyError) {
    for task in tasks {
        task.handle.abort(cause.clone(), false);
    }
}

fn last_failure<T>(futures: &[TaskFuture<T>], last: Option<TaskId>) -> TaskError {
    let future = last
        .and_then(|id| futures.iter().find(|future| future.id() == id))
        .or_else(|| futures.last());
    let Some(handle) = future.map(TaskFuture::handle) else {
        return TaskError::Cancelled;
    };
    match handle.state() {
        TaskState::Failed => handle
            .failure()
            .map_or(TaskError::Cancelled, TaskError::Failed),
        TaskState::Aborted => TaskError::Aborted(handle.raised_abort_cause()),
        _ => TaskError::Cancelled,
    }
}
