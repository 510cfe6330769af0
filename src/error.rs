use thiserror::Error;

use crate::state_machine::JobState;

#[derive(Debug, Error)]
pub enum RunlaneError {
    #[error("Queue is full ({max_depth} jobs waiting)")]
    QueueFull { max_depth: usize },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} has no result yet (state {state})")]
    NotReady { job_id: String, state: JobState },

    #[error("Job {job_id} already finished (state {state})")]
    AlreadyTerminal { job_id: String, state: JobState },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Unknown framework: {0}")]
    UnknownFramework(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RunlaneError {
    /// Stable machine-readable code used by the HTTP layer and the CLI client.
    pub fn code(&self) -> &'static str {
        match self {
            RunlaneError::QueueFull { .. } => "queue_full",
            RunlaneError::JobNotFound(_) => "not_found",
            RunlaneError::NotReady { .. } => "not_ready",
            RunlaneError::AlreadyTerminal { .. } => "already_terminal",
            RunlaneError::InvalidTransition { .. } => "invalid_transition",
            RunlaneError::UnknownFramework(_) => "unknown_framework",
            RunlaneError::InvalidRequest(_) => "invalid_request",
            RunlaneError::Config(_) => "config",
            RunlaneError::Git(_) => "git",
            RunlaneError::Io(_) => "io",
            RunlaneError::Json(_) => "json",
            RunlaneError::Toml(_) => "toml",
        }
    }
}

pub type Result<T, E = RunlaneError> = std::result::Result<T, E>;
