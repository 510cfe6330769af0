use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::state::JobState;

/// Why an attempt did not succeed.
///
/// The set is closed on purpose: the retry engine matches on it exhaustively,
/// so a new variant has to be given a retry ceiling before the crate compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClassification {
    TestFailure,
    CompilationError,
    RuntimeCrash,
    Timeout,
    GitConflict,
    PermissionError,
    MissingDependency,
    RateLimited,
    ResourceExhausted,
    Unknown,
}

impl FailureClassification {
    pub const ALL: [FailureClassification; 10] = [
        FailureClassification::TestFailure,
        FailureClassification::CompilationError,
        FailureClassification::RuntimeCrash,
        FailureClassification::Timeout,
        FailureClassification::GitConflict,
        FailureClassification::PermissionError,
        FailureClassification::MissingDependency,
        FailureClassification::RateLimited,
        FailureClassification::ResourceExhausted,
        FailureClassification::Unknown,
    ];

    /// Fatal classifications terminate a job on first occurrence.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            FailureClassification::PermissionError
                | FailureClassification::MissingDependency
                | FailureClassification::ResourceExhausted
        )
    }

    /// Terminal job state reached when a job stops on this classification.
    pub fn terminal_state(self) -> JobState {
        match self {
            FailureClassification::Timeout => JobState::TimedOut,
            FailureClassification::RuntimeCrash => JobState::Crashed,
            _ => JobState::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClassification::TestFailure => "test_failure",
            FailureClassification::CompilationError => "compilation_error",
            FailureClassification::RuntimeCrash => "runtime_crash",
            FailureClassification::Timeout => "timeout",
            FailureClassification::GitConflict => "git_conflict",
            FailureClassification::PermissionError => "permission_error",
            FailureClassification::MissingDependency => "missing_dependency",
            FailureClassification::RateLimited => "rate_limited",
            FailureClassification::ResourceExhausted => "resource_exhausted",
            FailureClassification::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown failure classification '{s}'"))
    }
}
