pub mod error;
pub mod policy;
pub mod task;

pub use error::{PolicyError, PolicyErrorKind, TaskError, TaskFailure, TaskPanicked};
pub use policy::{ExecutorState, Limit, MaxPolicy, QueueFullAction};
pub use task::{AwaitOutcome, TaskId, TaskState};
