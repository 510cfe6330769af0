use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::Job;
use crate::error::{Result, RunlaneError};

/// Lifecycle states of a job.
///
/// Each job flows through: QUEUED → RUNNING → terminal, looping back to
/// QUEUED when the retry engine grants another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Crashed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::TimedOut => write!(f, "TIMED_OUT"),
            JobState::Crashed => write!(f, "CRASHED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Applies state transitions to a `Job`, rejecting edges the lifecycle does
/// not allow.
pub struct StateMachine;

impl StateMachine {
    pub fn can_transition(from: JobState, to: JobState) -> bool {
        match (from, to) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Queued, JobState::Cancelled) => true,
            // Retry re-enters the queue.
            (JobState::Running, JobState::Queued) => true,
            (JobState::Running, target) => target.is_terminal(),
            _ => false,
        }
    }

    /// Move `job` to `to`, recording the previous state in its history.
    pub fn transition(job: &mut Job, to: JobState) -> Result<()> {
        if !Self::can_transition(job.state, to) {
            return Err(RunlaneError::InvalidTransition {
                from: job.state,
                to,
            });
        }
        job.state_history.push(job.state);
        job.state = to;
        job.updated_at = chrono::Utc::now();
        Ok(())
    }
}
