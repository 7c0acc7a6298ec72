use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use policy_core::executor::{StartContext, ThresholdCallback};
use policy_core::models::{
    AwaitOutcome, Limit, PolicyErrorKind, TaskError, TaskFailure, TaskState,
};
use policy_core::{
    BackingPool, PolicyExecutor, SharedPool, TaskCallback, TaskCancellationToken, TaskHandle,
};
use tokio::sync::watch;

fn pool() -> Arc<dyn BackingPool> {
    Arc::new(SharedPool::current().unwrap())
}

fn counter(count: &Arc<AtomicUsize>) -> ThresholdCallback {
    let count = count.clone();
    Arc::new(move || {
        count.fetch_add(1, Ordering::SeqCst);
    })
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    reject_submit: bool,
    reject_start: bool,
    cancel_on_submit: bool,
    cancel_on_start: bool,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }
}

impl TaskCallback for Recorder {
    fn on_submit(
        &self,
        task: &TaskHandle,
        invoke_any_count: Option<usize>,
    ) -> Result<(), TaskFailure> {
        self.push(format!("submit any={invoke_any_count:?}"));
        if self.cancel_on_submit {
            task.cancel(false);
        }
        if self.reject_submit {
            return Err(Arc::new(io::Error::other("not today")));
        }
        Ok(())
    }

    fn on_start(&self, task: &TaskHandle) -> Result<Option<StartContext>, TaskFailure> {
        self.push("start".to_string());
        if self.cancel_on_start {
            task.cancel(false);
        }
        if self.reject_start {
            return Err(Arc::new(io::Error::other("not now")));
        }
        Ok(Some(Arc::new(42u32)))
    }

    fn on_end(
        &self,
        _task: &TaskHandle,
        start: Option<&StartContext>,
        aborted: bool,
        pending: i32,
        failure: Option<&TaskFailure>,
    ) {
        let start = start.and_then(|start| start.downcast_ref::<u32>().copied());
        self.push(format!(
            "end aborted={aborted} pending={pending} start={start:?} failed={}",
            failure.is_some()
        ));
    }

    fn on_cancel(&self, _task: &TaskHandle, timed_out: bool, while_running: bool) {
        self.push(format!("cancel timed_out={timed_out} running={while_running}"));
    }

    fn name(&self) -> Option<String> {
        Some("recorded".to_string())
    }
}

#[tokio::test]
async fn callbacks_follow_task_lifecycle() {
    let executor = PolicyExecutor::new("callbacks", pool());
    let recorder = Arc::new(Recorder::default());

    let future = executor
        .submit_with_callback(|_| async { Ok::<_, io::Error>(5) }, recorder.clone())
        .await
        .unwrap();
    assert_eq!(future.join().await.unwrap(), 5);
    wait_until(|| recorder.count("end") == 1).await;

    assert_eq!(
        recorder.events(),
        vec![
            "submit any=None".to_string(),
            "start".to_string(),
            "end aborted=false pending=0 start=Some(42) failed=false".to_string(),
        ]
    );
}

#[tokio::test]
async fn failing_body_reports_failure_to_on_end() {
    let executor = PolicyExecutor::new("callbacks-failure", pool());
    let recorder = Arc::new(Recorder::default());

    let future = executor
        .submit_with_callback(
            |_| async { Err::<(), _>(io::Error::other("broken")) },
            recorder.clone(),
        )
        .await
        .unwrap();
    assert!(matches!(future.join().await, Err(TaskError::Failed(_))));
    wait_until(|| recorder.count("end") == 1).await;
    assert!(recorder.events().contains(
        &"end aborted=false pending=0 start=Some(42) failed=true".to_string()
    ));
}

#[tokio::test]
async fn on_submit_error_rejects_task() {
    let executor = PolicyExecutor::new("callbacks-submit", pool());
    let recorder = Arc::new(Recorder {
        reject_submit: true,
        ..Recorder::default()
    });
    let ran = Arc::new(AtomicUsize::new(0));

    let error = executor
        .submit_with_callback(
            {
                let ran = ran.clone();
                move |_| async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, io::Error>(())
                }
            },
            recorder.clone(),
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind, PolicyErrorKind::Rejected);
    assert!(error.message.contains("not today"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.count("start"), 0);
    assert_eq!(recorder.count("end aborted=true"), 1);
}

#[tokio::test]
async fn on_start_error_aborts_task() {
    let executor = PolicyExecutor::new("callbacks-start", pool());
    let recorder = Arc::new(Recorder {
        reject_start: true,
        ..Recorder::default()
    });
    let ran = Arc::new(AtomicUsize::new(0));

    let future = executor
        .submit_with_callback(
            {
                let ran = ran.clone();
                move |_| async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, io::Error>(())
                }
            },
            recorder.clone(),
        )
        .await
        .unwrap();

    match future.join().await {
        Err(TaskError::Aborted(cause)) => assert_eq!(cause.kind, PolicyErrorKind::Rejected),
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    wait_until(|| recorder.count("end") == 1).await;
    assert_eq!(recorder.count("end aborted=true"), 1);
}

#[tokio::test]
async fn cancel_during_on_start_aborts_task() {
    let executor = PolicyExecutor::new("callbacks-cancel-start", pool());
    let recorder = Arc::new(Recorder {
        cancel_on_start: true,
        ..Recorder::default()
    });
    let ran = Arc::new(AtomicUsize::new(0));

    let future = executor
        .submit_with_callback(
            {
                let ran = ran.clone();
                move |_| async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, io::Error>(())
                }
            },
            recorder.clone(),
        )
        .await
        .unwrap();

    assert_eq!(
        future.await_state(Some(Duration::from_secs(1))).await,
        AwaitOutcome::Completed(TaskState::Aborted)
    );
    match future.join().await {
        Err(TaskError::Aborted(cause)) => assert_eq!(cause.kind, PolicyErrorKind::Interrupted),
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    wait_until(|| recorder.count("end") == 1).await;
    assert_eq!(recorder.count("cancel timed_out=false running=false"), 1);
    assert_eq!(
        recorder.count("end aborted=true pending=0 start=Some(42) failed=true"),
        1
    );
}

#[tokio::test]
async fn cancel_during_on_submit_skips_task() {
    let executor = PolicyExecutor::new("callbacks-cancel-submit", pool());
    let recorder = Arc::new(Recorder {
        cancel_on_submit: true,
        ..Recorder::default()
    });

    let future = executor
        .submit_with_callback(|_| async { Ok::<_, io::Error>(1) }, recorder.clone())
        .await
        .unwrap();

    assert_eq!(future.state(), TaskState::Cancelled);
    assert!(matches!(future.join().await, Err(TaskError::Cancelled)));
    assert_eq!(recorder.count("start"), 0);
    assert_eq!(recorder.count("cancel"), 1);
    assert_eq!(recorder.count("end aborted=true"), 1);
    assert_eq!(executor.queued_task_count(), 0);
}

#[tokio::test]
async fn interrupting_running_task_fires_on_cancel_once() {
    let executor = PolicyExecutor::new("callbacks-interrupt", pool());
    let recorder = Arc::new(Recorder::default());
    let (_open, gate) = watch::channel(false);

    let future = executor
        .submit_with_callback(
            move |_| async move {
                let mut gate = gate;
                let _ = gate.wait_for(|open| *open).await;
                Ok::<_, io::Error>(())
            },
            recorder.clone(),
        )
        .await
        .unwrap();
    wait_until(|| future.state() == TaskState::Running).await;

    assert!(future.cancel(true));
    assert!(!future.cancel(true));
    assert_eq!(future.state(), TaskState::Cancelled);
    assert!(matches!(future.join().await, Err(TaskError::Cancelled)));

    wait_until(|| recorder.count("end") == 1).await;
    assert_eq!(recorder.count("cancel timed_out=false running=true"), 1);
    assert_eq!(recorder.count("cancel"), 1);
    assert_eq!(recorder.count("end aborted=false"), 1);
    wait_until(|| executor.running_task_count() == 0).await;
}

#[tokio::test]
async fn start_timeout_aborts_queued_task() {
    let executor = PolicyExecutor::new("callbacks-start-timeout", pool());
    executor
        .max_concurrency(Limit::Bounded(1))
        .unwrap()
        .start_timeout(Some(Duration::from_millis(30)))
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    let (open, gate) = watch::channel(false);

    let blocker = executor
        .submit(move |_| async move {
            let mut gate = gate;
            let _ = gate.wait_for(|open| *open).await;
            Ok::<_, io::Error>(())
        })
        .await
        .unwrap();
    let late = executor
        .submit_with_callback(|_| async { Ok::<_, io::Error>(()) }, recorder.clone())
        .await
        .unwrap();

    match late.join().await {
        Err(TaskError::Aborted(cause)) => assert_eq!(cause.kind, PolicyErrorKind::StartTimeout),
        other => panic!("expected start timeout, got {other:?}"),
    }
    assert_eq!(executor.queued_task_count(), 0);
    wait_until(|| recorder.count("end") == 1).await;
    assert_eq!(recorder.count("cancel timed_out=true running=false"), 1);
    assert_eq!(recorder.count("start"), 0);

    open.send(true).unwrap();
    blocker.join().await.unwrap();
}

#[tokio::test]
async fn deferred_work_reports_pending_completions() {
    let executor = PolicyExecutor::new("callbacks-pending", pool());
    let recorder = Arc::new(Recorder::default());

    let future = executor
        .submit_with_callback(
            |token| async move {
                let pending = token.defer_completion();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    drop(pending);
                });
                Ok::<_, io::Error>(())
            },
            recorder.clone(),
        )
        .await
        .unwrap();
    future.join().await.unwrap();

    wait_until(|| recorder.count("end") == 2).await;
    let ends: Vec<String> = recorder
        .events()
        .into_iter()
        .filter(|event| event.starts_with("end"))
        .collect();
    assert_eq!(
        ends,
        vec![
            "end aborted=false pending=1 start=Some(42) failed=false".to_string(),
            "end aborted=false pending=-1 start=Some(42) failed=false".to_string(),
        ]
    );
}

#[tokio::test]
async fn concurrency_threshold_fires_once() {
    let executor = PolicyExecutor::new("threshold-concurrency", pool());
    let fired = Arc::new(AtomicUsize::new(0));
    executor
        .register_concurrency_callback(1, Some(counter(&fired)))
        .unwrap();
    let (open, gate) = watch::channel(false);

    let mut futures = Vec::new();
    for _ in 0..3 {
        let gate = gate.clone();
        futures.push(
            executor
                .submit(move |_| async move {
                    let mut gate = gate;
                    let _ = gate.wait_for(|open| *open).await;
                    Ok::<_, io::Error>(())
                })
                .await
                .unwrap(),
        );
    }
    wait_until(|| executor.running_task_count() == 3).await;
    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;

    open.send(true).unwrap();
    for future in futures {
        future.join().await.unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queue_size_and_late_start_thresholds_fire() {
    let executor = PolicyExecutor::new("threshold-queue", pool());
    executor
        .max_concurrency(Limit::Bounded(1))
        .unwrap()
        .max_queue_size(Limit::Bounded(2))
        .unwrap();
    let queue_low = Arc::new(AtomicUsize::new(0));
    let late = Arc::new(AtomicUsize::new(0));
    executor
        .register_queue_size_callback(1, Some(counter(&queue_low)))
        .unwrap();
    executor
        .register_late_start_callback(Duration::from_millis(10), Some(counter(&late)))
        .unwrap();

    let sleeper = |millis: u64| {
        move |_: TaskCancellationToken| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, io::Error>(())
        }
    };
    let first = executor.submit(sleeper(40)).await.unwrap();
    let second = executor.submit(sleeper(1)).await.unwrap();
    assert_eq!(queue_low.load(Ordering::SeqCst), 0);
    let third = executor.submit(sleeper(1)).await.unwrap();

    for future in [first, second, third] {
        future.join().await.unwrap();
    }
    wait_until(|| queue_low.load(Ordering::SeqCst) == 1).await;
    wait_until(|| late.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn task_name_comes_from_callback() {
    let executor = PolicyExecutor::new("callbacks-name", pool());
    let future = executor
        .submit_with_callback(
            |_| async { Ok::<_, io::Error>(()) },
            Arc::new(Recorder::default()),
        )
        .await
        .unwrap();
    assert_eq!(future.handle().name().as_deref(), Some("recorded"));
    assert!(future.handle().to_string().ends_with("recorded"));
    future.join().await.unwrap();
}
