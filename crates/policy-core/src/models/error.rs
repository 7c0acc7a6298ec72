use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::models::TaskId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PolicyErrorKind {
    Rejected,
    InvalidInput,
    IllegalState,
    StartTimeout,
    Interrupted,
    Timeout,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct PolicyError {
    pub executor: Option<String>,
    pub task: Option<TaskId>,
    pub kind: PolicyErrorKind,
    pub message: String,
}

impl PolicyError {
    pub fn new(kind: PolicyErrorKind, message: impl Into<String>) -> Self {
        Self {
            executor: None,
            task: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_executor(mut self, identifier: &str) -> Self {
        self.executor = Some(identifier.to_string());
        self
    }

    pub fn for_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }
}

/// Error produced by a task body or a callback. Shared so the same failure can be
/// handed to `on_end` and returned from every `get`.
pub type TaskFailure = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Failure recorded when a task body panics.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("task panicked: {message}")]
pub struct TaskPanicked {
    pub message: String,
}

impl TaskPanicked {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}

/// Why a task result could not be retrieved.
#[derive(Clone, Debug, Error)]
pub enum TaskError {
    /// The task never ran: rejected, start timeout, or its `on_start` failed.
    #[error("task aborted: {0}")]
    Aborted(PolicyError),
    #[error("task cancelled")]
    Cancelled,
    /// The body returned an error (or panicked). Holds the exact error value.
    #[error("task failed: {0}")]
    Failed(TaskFailure),
    #[error("timed out after {0:?} waiting for the task")]
    Timeout(Duration),
    /// A task tried to wait for its own result.
    #[error("task cannot wait for its own completion")]
    SelfWait,
}

impl TaskError {
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
