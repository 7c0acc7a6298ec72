use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::models::{PolicyError, PolicyErrorKind};

/// Positive bound or no bound at all.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Limit {
    #[default]
    Unbounded,
    Bounded(usize),
}

impl Limit {
    pub fn validate(self, setting: &str) -> Result<Self, PolicyError> {
        match self {
            Self::Bounded(0) => Err(PolicyError::new(
                PolicyErrorKind::InvalidInput,
                format!("{setting} must be at least 1 or unbounded"),
            )),
            other => Ok(other),
        }
    }

    pub fn get(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(value) => Some(value),
        }
    }

    /// Whether one more unit fits when `used` are taken.
    pub fn admits(self, used: usize) -> bool {
        self.get().is_none_or(|max| used < max)
    }

    pub fn at_least(self, value: usize) -> bool {
        self.get().is_none_or(|max| value <= max)
    }

    pub fn remaining(self, used: usize) -> Option<usize> {
        self.get().map(|max| max.saturating_sub(used))
    }
}

impl From<Option<usize>> for Limit {
    fn from(value: Option<usize>) -> Self {
        value.map_or(Self::Unbounded, Self::Bounded)
    }
}

impl Display for Limit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbounded => write!(f, "unbounded"),
            Self::Bounded(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum QueueFullAction {
    #[default]
    Abort,
    CallerRuns,
    CallerRunsIfSameExecutor,
}

/// How strictly `max_concurrency` binds tasks that run on the submitter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxPolicy {
    #[default]
    Loose,
    Strict,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum ExecutorState {
    Active,
    ShuttingDown,
    TasksCancelled,
    ShutDown,
}

impl ExecutorState {
    pub fn accepts_submissions(self) -> bool {
        self == Self::Active
    }

    pub fn can_start_tasks(self) -> bool {
        matches!(self, Self::Active | Self::ShuttingDown)
    }

    pub fn is_shutdown(self) -> bool {
        self != Self::Active
    }
}
