use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::runtime::Handle;

use crate::executor::PolicyResult;
use crate::models::{PolicyError, PolicyErrorKind};

pub type PoolJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The shared worker pool that policy executors dispatch onto. Executors never own
/// it and never shut it down.
pub trait BackingPool: Send + Sync {
    /// Runs `job` on a pool worker. Expedited jobs are served before regular ones when
    /// the pool is saturated.
    fn execute(&self, job: PoolJob, expedite: bool) -> PolicyResult<()>;

    /// Runs a job that spends its life waiting on a timer. It must not take a worker
    /// away from regular jobs while it waits.
    fn execute_timer(&self, job: PoolJob) -> PolicyResult<()>;
}

/// Tokio-backed pool. With a worker limit, jobs beyond the limit wait in two FIFO
/// lanes and the expedited lane is always drained first.
#[derive(Clone)]
pub struct SharedPool {
    inner: Arc<SharedPoolInner>,
}

struct SharedPoolInner {
    handle: Handle,
    max_workers: Option<usize>,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    active: usize,
    expedited: VecDeque<PoolJob>,
    regular: VecDeque<PoolJob>,
    closed: bool,
}

impl SharedPool {
    pub fn new(handle: Handle) -> Self {
        Self::build(handle, None)
    }

    pub fn with_max_workers(handle: Handle, max_workers: usize) -> Self {
        Self::build(handle, Some(max_workers.max(1)))
    }

    /// Pool on the runtime the caller is running in.
    pub fn current() -> PolicyResult<Self> {
        Handle::try_current().map(Self::new).map_err(|error| {
            PolicyError::new(
                PolicyErrorKind::IllegalState,
                format!("no tokio runtime available for the shared pool: {error}"),
            )
        })
    }

    fn build(handle: Handle, max_workers: Option<usize>) -> Self {
        Self {
            inner: Arc::new(SharedPoolInner {
                handle,
                max_workers,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.lock_state().active
    }

    pub fn waiting_jobs(&self) -> usize {
        let state = self.lock_state();
        state.expedited.len() + state.regular.len()
    }

    /// Rejects further jobs. Jobs already accepted still run.
    pub fn close(&self) {
        self.lock_state().closed = true;
    }

    fn spawn_worker(&self, job: PoolJob) {
        let pool = self.clone();
        self.inner.handle.spawn(async move {
            let mut next = Some(job);
            while let Some(job) = next.take() {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    tracing::error!("shared pool job panicked");
                }
                next = pool.next_job();
            }
        });
    }

    fn next_job(&self) -> Option<PoolJob> {
        let mut state = self.lock_state();
        let next = state
            .expedited
            .pop_front()
            .or_else(|| state.regular.pop_front());
        if next.is_none() {
            state.active = state.active.saturating_sub(1);
        }
        next
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackingPool for SharedPool {
    fn execute(&self, job: PoolJob, expedite: bool) -> PolicyResult<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(PolicyError::new(
                PolicyErrorKind::Rejected,
                "shared pool is closed",
            ));
        }
        if self
            .inner
            .max_workers
            .is_none_or(|max| state.active < max)
        {
            state.active += 1;
            drop(state);
            self.spawn_worker(job);
        } else if expedite {
            state.expedited.push_back(job);
        } else {
            state.regular.push_back(job);
        }
        Ok(())
    }

    fn execute_timer(&self, job: PoolJob) -> PolicyResult<()> {
        if self.lock_state().closed {
            return Err(PolicyError::new(
                PolicyErrorKind::Rejected,
                "shared pool is closed",
            ));
        }
        self.inner.handle.spawn(job);
        Ok(())
    }
}
