use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::PolicyResult;
use crate::models::{Limit, MaxPolicy, PolicyError, PolicyErrorKind, QueueFullAction};

/// Declarative policy for one executor. Absent limits mean unbounded.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub core_concurrency: usize,
    pub max_concurrency: Option<usize>,
    pub max_policy: MaxPolicy,
    pub max_queue_size: Option<usize>,
    pub max_wait_for_enqueue_millis: u64,
    pub queue_full_action: QueueFullAction,
    pub start_timeout_millis: Option<u64>,
}

impl PolicyConfig {
    pub fn from_json_str(json: &str) -> PolicyResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|error| {
            PolicyError::new(
                PolicyErrorKind::InvalidInput,
                format!("invalid policy configuration: {error}"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PolicyResult<()> {
        let max = self.max_concurrency_limit().validate("maxConcurrency")?;
        self.max_queue_size_limit().validate("maxQueueSize")?;
        if !max.at_least(self.core_concurrency) {
            return Err(PolicyError::new(
                PolicyErrorKind::InvalidInput,
                format!(
                    "coreConcurrency {} exceeds maxConcurrency {max}",
                    self.core_concurrency
                ),
            ));
        }
        Ok(())
    }

    pub fn max_concurrency_limit(&self) -> Limit {
        Limit::from(self.max_concurrency)
    }

    pub fn max_queue_size_limit(&self) -> Limit {
        Limit::from(self.max_queue_size)
    }

    pub fn max_wait_for_enqueue(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_enqueue_millis)
    }

    pub fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout_millis.map(Duration::from_millis)
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
