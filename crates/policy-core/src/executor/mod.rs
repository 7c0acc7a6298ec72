pub mod callback;
pub mod cancellation;
pub mod future;
pub mod group;
pub mod policy_executor;
pub mod pool;
pub mod provider;

pub use callback::{StartContext, TaskCallback, ThresholdCallback};
pub use cancellation::{PendingWork, TaskCancellationToken};
pub use future::{TaskFuture, TaskHandle};
pub use policy_executor::{ExecutorSnapshot, PolicyExecutor};
pub use pool::{BackingPool, PoolJob, SharedPool};
pub use provider::PolicyExecutorProvider;

use crate::models::PolicyError;

pub type PolicyResult<T> = Result<T, PolicyError>;
