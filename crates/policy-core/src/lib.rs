pub mod config;
pub mod executor;
pub mod logging;
pub mod models;
pub mod task_context;

pub use config::PolicyConfig;
pub use executor::{
    BackingPool, PolicyExecutor, PolicyExecutorProvider, PolicyResult, SharedPool, TaskCallback,
    TaskCancellationToken, TaskFuture, TaskHandle,
};
