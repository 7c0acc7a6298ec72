use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use policy_core::models::{Limit, MaxPolicy, PolicyErrorKind, TaskError, TaskState};
use policy_core::{BackingPool, PolicyExecutor, SharedPool, TaskCancellationToken};
use tokio::sync::watch;

type Body = BoxFuture<'static, Result<usize, io::Error>>;
type Task = Box<dyn FnOnce(TaskCancellationToken) -> Body + Send>;

fn pool() -> Arc<dyn BackingPool> {
    Arc::new(SharedPool::current().unwrap())
}

fn succeed_after(millis: u64, value: usize) -> Task {
    Box::new(move |_| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(value)
        })
    })
}

fn fail_after(millis: u64, message: &'static str) -> Task {
    Box::new(move |_| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Err(io::Error::other(message))
        })
    })
}

fn never_finishes() -> Task {
    Box::new(|_| Box::pin(futures::future::pending()))
}

#[tokio::test]
async fn invoke_all_waits_for_every_task() {
    let executor = PolicyExecutor::new("invoke-all", pool());
    let tasks: Vec<Task> = (0..4).map(|value| succeed_after(5, value)).collect();

    let futures = executor.invoke_all(tasks).await.unwrap();
    assert!(futures.iter().all(|future| future.state() == TaskState::Success));
    let mut values = Vec::new();
    for future in futures {
        values.push(future.join().await.unwrap());
    }
    assert_eq!(values, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn invoke_all_runs_overflow_on_caller_instead_of_rejecting() {
    let executor = PolicyExecutor::new("invoke-all-overflow", pool());
    executor
        .max_concurrency(Limit::Bounded(1))
        .unwrap()
        .max_queue_size(Limit::Bounded(1))
        .unwrap();
    let tasks: Vec<Task> = (0..5).map(|value| succeed_after(5, value)).collect();

    let futures = executor.invoke_all(tasks).await.unwrap();
    assert_eq!(futures.len(), 5);
    for (expected, future) in futures.into_iter().enumerate() {
        assert_eq!(future.join().await.unwrap(), expected);
    }
    assert_eq!(executor.running_task_count(), 0);
}

#[tokio::test]
async fn strict_invoke_all_without_free_slot_queues_every_task() {
    let executor = PolicyExecutor::new("invoke-all-strict", pool());
    executor
        .max_concurrency(Limit::Bounded(1))
        .unwrap()
        .max_policy(MaxPolicy::Strict)
        .unwrap();
    let (open, gate) = watch::channel(false);
    let blocker = executor
        .submit(move |_| async move {
            let mut gate = gate;
            let _ = gate.wait_for(|open| *open).await;
            Ok::<_, io::Error>(())
        })
        .await
        .unwrap();

    let tasks: Vec<Task> = (0..3).map(|value| succeed_after(1, value)).collect();
    let (futures, ()) = tokio::join!(executor.invoke_all(tasks), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(executor.queued_task_count(), 3);
        open.send(true).unwrap();
    });

    let futures = futures.unwrap();
    for (expected, future) in futures.into_iter().enumerate() {
        assert_eq!(future.join().await.unwrap(), expected);
    }
    blocker.join().await.unwrap();
}

#[tokio::test]
async fn invoke_all_keeps_individual_failures() {
    let executor = PolicyExecutor::new("invoke-all-failure", pool());
    let tasks = vec![succeed_after(1, 1), fail_after(1, "second"), succeed_after(1, 3)];

    let futures = executor.invoke_all(tasks).await.unwrap();
    let states: Vec<TaskState> = futures.iter().map(|future| future.state()).collect();
    assert_eq!(
        states,
        vec![TaskState::Success, TaskState::Failed, TaskState::Success]
    );
}

#[tokio::test]
async fn invoke_all_timed_cancels_unfinished_tasks() {
    let executor = PolicyExecutor::new("invoke-all-timed", pool());
    let tasks = vec![succeed_after(1, 1), never_finishes(), never_finishes()];

    let futures = executor
        .invoke_all_timed(tasks, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(futures[0].state(), TaskState::Success);
    assert!(futures[1..].iter().all(|future| future.state() == TaskState::Cancelled));
}

#[tokio::test]
async fn invoke_any_returns_first_success_and_cancels_the_rest() {
    let executor = PolicyExecutor::new("invoke-any", pool());
    let slow_finished = Arc::new(AtomicUsize::new(0));
    let slow: Task = {
        let slow_finished = slow_finished.clone();
        Box::new(move |_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                slow_finished.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            })
        })
    };
    let tasks = vec![fail_after(1, "fast failure"), succeed_after(20, 2), slow];

    assert_eq!(executor.invoke_any(tasks).await.unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(slow_finished.load(Ordering::SeqCst), 0);
    assert_eq!(executor.running_task_count(), 0);
}

#[tokio::test]
async fn invoke_any_without_success_reports_a_failure() {
    let executor = PolicyExecutor::new("invoke-any-failure", pool());
    let tasks = vec![fail_after(1, "first"), fail_after(10, "last")];

    match executor.invoke_any(tasks).await {
        Err(TaskError::Failed(failure)) => {
            let error = failure.downcast_ref::<io::Error>().unwrap();
            assert_eq!(error.to_string(), "last");
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[tokio::test]
async fn invoke_any_with_no_tasks_is_invalid() {
    let executor = PolicyExecutor::new("invoke-any-empty", pool());
    let tasks: Vec<Task> = Vec::new();

    match executor.invoke_any(tasks).await {
        Err(TaskError::Aborted(cause)) => assert_eq!(cause.kind, PolicyErrorKind::InvalidInput),
        other => panic!("expected invalid input, got {other:?}"),
    }
}

#[tokio::test]
async fn invoke_any_single_task_runs_inline() {
    let executor = PolicyExecutor::new("invoke-any-single", pool());
    assert_eq!(
        executor.invoke_any(vec![succeed_after(1, 9)]).await.unwrap(),
        9
    );
}

#[tokio::test]
async fn invoke_any_timed_gives_up_after_timeout() {
    let executor = PolicyExecutor::new("invoke-any-timed", pool());
    let tasks = vec![never_finishes(), never_finishes()];

    match executor
        .invoke_any_timed(tasks, Duration::from_millis(30))
        .await
    {
        Err(TaskError::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(30)),
        other => panic!("expected a timeout, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(executor.running_task_count(), 0);
}

#[tokio::test]
async fn timed_groups_accept_unlimited_timeouts() {
    let executor = PolicyExecutor::new("invoke-unlimited", pool());
    executor.max_wait_for_enqueue(Duration::MAX).unwrap();

    let tasks: Vec<Task> = (0..3).map(|value| succeed_after(1, value)).collect();
    let futures = executor
        .invoke_all_timed(tasks, Duration::MAX)
        .await
        .unwrap();
    assert!(futures.iter().all(|future| future.state() == TaskState::Success));

    let tasks = vec![fail_after(1, "first"), succeed_after(5, 7)];
    assert_eq!(
        executor.invoke_any_timed(tasks, Duration::MAX).await.unwrap(),
        7
    );
}

#[tokio::test]
async fn groups_are_rejected_after_shutdown() {
    let executor = PolicyExecutor::new("invoke-after-shutdown", pool());
    executor.shutdown();

    let error = executor
        .invoke_all(vec![succeed_after(1, 1)])
        .await
        .unwrap_err();
    assert_eq!(error.kind, PolicyErrorKind::Rejected);
    assert!(matches!(
        executor.invoke_any(vec![succeed_after(1, 1)]).await,
        Err(TaskError::Aborted(_))
    ));
}
