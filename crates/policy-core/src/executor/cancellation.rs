use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

/// Cooperative interruption signal handed to every task body.
///
/// Cancelling with interruption sets the flag and wakes `cancelled()`. The executor also
/// stops polling the body, so a body observes interruption at its next await point.
#[derive(Clone)]
pub struct TaskCancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    flag: AtomicBool,
    notify: Notify,
    pending: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    outstanding: usize,
    sealed: bool,
    on_release: Option<ReleaseHook>,
}

impl TaskCancellationToken {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                pending: Mutex::new(PendingState::default()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Marks work started by the body that outlives the body itself. The task's
    /// `on_end` reports the number of guards still held when the body returned and
    /// is invoked again with `pending = -1` as each of those guards is dropped.
    pub fn defer_completion(&self) -> PendingWork {
        self.lock_pending().outstanding += 1;
        PendingWork {
            token: self.clone(),
        }
    }

    pub fn pending_work(&self) -> usize {
        self.lock_pending().outstanding
    }

    /// Called once the body has ended. Returns the outstanding count and keeps the
    /// hook for guards released later.
    pub(crate) fn seal_pending(&self, on_release: Option<ReleaseHook>) -> usize {
        let mut pending = self.lock_pending();
        pending.sealed = true;
        if pending.outstanding > 0 {
            pending.on_release = on_release;
        }
        pending.outstanding
    }

    fn release_pending(&self) {
        let hook = {
            let mut pending = self.lock_pending();
            pending.outstanding = pending.outstanding.saturating_sub(1);
            if pending.sealed {
                pending.on_release.clone()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for TaskCancellationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Guard returned by [`TaskCancellationToken::defer_completion`].
#[must_use = "dropping the guard immediately releases the deferred work"]
pub struct PendingWork {
    token: TaskCancellationToken,
}

impl Drop for PendingWork {
    fn drop(&mut self) {
        self.token.release_pending();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = TaskCancellationToken::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn release_hook_fires_only_after_seal() {
        let token = TaskCancellationToken::new();
        let released = Arc::new(AtomicUsize::new(0));
        let early = token.defer_completion();
        let late = token.defer_completion();
        drop(early);
        let hook: ReleaseHook = Arc::new({
            let released = released.clone();
            move || {
                released.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(token.seal_pending(Some(hook)), 1);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(late);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(token.pending_work(), 0);
    }
}
