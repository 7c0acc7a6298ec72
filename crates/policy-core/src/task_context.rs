use std::future::Future;

use crate::models::TaskId;

/// Identity of the executor instance a task scope belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) struct ExecutorKey(pub(crate) usize);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TaskScope {
    pub(crate) executor: ExecutorKey,
    pub(crate) task: TaskId,
}

tokio::task_local! {
    static CURRENT_TASK: TaskScope;
}

pub fn current_task_id() -> Option<TaskId> {
    current_scope().map(|scope| scope.task)
}

pub(crate) fn current_scope() -> Option<TaskScope> {
    CURRENT_TASK.try_with(|scope| *scope).ok()
}

pub(crate) async fn with_task_scope<F: Future>(scope: TaskScope, operation: F) -> F::Output {
    CURRENT_TASK.scope(scope, operation).await
}
