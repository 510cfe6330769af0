use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::failure::FailureClassification;
use super::state::JobState;
use crate::parser::NormalizedResult;

/// Queue priority tier. Variants are declared best-first so the derived
/// `Ord` ranks `High` ahead of `Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" | "medium" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_caller_id() -> String {
    "anonymous".to_string()
}

/// What a caller asks for when submitting a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Path or selector handed to the framework's runner.
    pub target: String,
    /// Framework id, resolved against the configured framework registry.
    pub framework: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_caller_id")]
    pub caller_id: String,
    /// Caller cap on additional attempts. Can only narrow the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Classifications the caller is willing to retry on. Can only narrow the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_retry_on: Option<Vec<FailureClassification>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Free-text description of the work under test.
    #[serde(default)]
    pub description: String,
}

impl JobSpec {
    pub fn new(target: impl Into<String>, framework: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            framework: framework.into(),
            timeout_secs: default_timeout_secs(),
            priority: Priority::default(),
            caller_id: default_caller_id(),
            max_retries: None,
            allow_retry_on: None,
            working_dir: None,
            description: String::new(),
        }
    }
}

/// Resource usage captured for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: u64,
    pub output_bytes: u64,
    /// User + system CPU time of the runner, where the platform exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
}

/// One execution of a job. Written once, when the attempt ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub timeout_secs: u64,
    /// `None` when the attempt succeeded.
    pub classification: Option<FailureClassification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub output_tail: String,
    pub result: NormalizedResult,
    pub usage: ResourceUsage,
    pub cost: f64,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.classification.is_none()
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinalOutcome {
    Succeeded,
    Failed { classification: FailureClassification },
    BudgetExceeded { classification: FailureClassification },
    Cancelled,
}

impl FinalOutcome {
    pub fn terminal_state(self) -> JobState {
        match self {
            FinalOutcome::Succeeded => JobState::Completed,
            FinalOutcome::Failed { classification } => classification.terminal_state(),
            FinalOutcome::BudgetExceeded { .. } => JobState::Failed,
            FinalOutcome::Cancelled => JobState::Cancelled,
        }
    }
}

impl fmt::Display for FinalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalOutcome::Succeeded => write!(f, "succeeded"),
            FinalOutcome::Failed { classification } => write!(f, "failed: {classification}"),
            FinalOutcome::BudgetExceeded { classification } => {
                write!(f, "budget exceeded after {classification}")
            }
            FinalOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A logical unit of test-execution work, possibly spanning several attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub spec: JobSpec,
    /// Work description handed to the runner; grows with failure context on retry.
    pub description: String,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    /// Number of the current (or next) attempt, starting at 1.
    pub attempt: u32,
    /// Effective timeout for the next attempt.
    pub timeout_secs: u64,
    pub timeout_extended: bool,
    pub attempts: Vec<AttemptRecord>,
    pub cost: f64,
    /// Submission order, used for FIFO ordering within a priority tier.
    pub sequence: u64,
    pub outcome: Option<FinalOutcome>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            description: spec.description.clone(),
            timeout_secs: spec.timeout_secs,
            spec,
            state: JobState::Queued,
            state_history: Vec::new(),
            attempt: 1,
            timeout_extended: false,
            attempts: Vec::new(),
            cost: 0.0,
            sequence,
            outcome: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Additional attempts already granted beyond the first.
    pub fn retries_used(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Structured audit record produced when a job reaches a terminal state.
/// This is the payload handed to notification listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: String,
    pub caller_id: String,
    pub target: String,
    pub framework: String,
    pub state: JobState,
    pub outcome: Option<FinalOutcome>,
    pub state_transitions: Vec<JobState>,
    pub attempts: u32,
    pub classifications: Vec<Option<FailureClassification>>,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    pub fn from_job(job: &Job) -> Self {
        let finished_at = job.finished_at.unwrap_or_else(Utc::now);
        let mut transitions = job.state_history.clone();
        transitions.push(job.state);

        Self {
            job_id: job.id.clone(),
            caller_id: job.spec.caller_id.clone(),
            target: job.spec.target.clone(),
            framework: job.spec.framework.clone(),
            state: job.state,
            outcome: job.outcome,
            state_transitions: transitions,
            attempts: job.attempts.len() as u32,
            classifications: job.attempts.iter().map(|a| a.classification).collect(),
            cost: job.cost,
            created_at: job.created_at,
            finished_at,
            duration_ms: (finished_at - job.created_at).num_milliseconds(),
        }
    }
}
