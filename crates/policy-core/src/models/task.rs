use std::fmt::{Display, Formatter};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum TaskState {
    Presubmit,
    Submitted,
    Running,
    Aborted,
    Cancelling,
    Cancelled,
    Failed,
    Success,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::Cancelled | Self::Failed | Self::Success
        )
    }

    /// Done from the submitter's point of view. A `Cancelling` task may still be
    /// executing its body but its outcome is already decided.
    pub fn is_done(self) -> bool {
        self.is_terminal() || self == Self::Cancelling
    }

    pub fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelling | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Presubmit, Submitted | Aborted | Cancelled)
                | (Submitted, Running | Aborted | Cancelled)
                | (Running, Cancelling | Failed | Success)
                | (Cancelling, Cancelled)
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AwaitOutcome {
    Completed(TaskState),
    /// The caller is the task itself, so waiting would never finish.
    Reentrant(TaskState),
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::TaskState::*;
    use super::*;

    #[test]
    fn terminal_states_have_no_successors() {
        let all = [
            Presubmit, Submitted, Running, Aborted, Cancelling, Cancelled, Failed, Success,
        ];
        for state in all.into_iter().filter(|state| state.is_terminal()) {
            assert!(all.iter().all(|next| !state.can_transition_to(*next)));
        }
    }

    #[test]
    fn running_task_cannot_jump_back_to_queue() {
        assert!(!Running.can_transition_to(Submitted));
        assert!(!Running.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(Cancelling.is_done());
        assert!(!Cancelling.is_terminal());
    }
}
