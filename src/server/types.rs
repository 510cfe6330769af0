//! Wire types of the HTTP API, shared by the server and [`RunlaneClient`](crate::client::RunlaneClient).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parser::NormalizedResult;
use crate::state_machine::{AttemptRecord, FinalOutcome, JobState, Priority};

/// Success envelope: `{"data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// Error envelope: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub queue_position: usize,
    pub estimated_wait_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub attempt: u32,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    pub timeout_secs: u64,
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<FinalOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub state: JobState,
    pub outcome: Option<FinalOutcome>,
    /// Normalized result of the last attempt.
    pub result: NormalizedResult,
    pub attempts: Vec<AttemptRecord>,
    pub cost: f64,
    /// Final work description, including carried-forward failure context.
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReceipt {
    pub job_id: String,
    pub state: JobState,
    pub was_running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReceipt {
    pub job_id: String,
    pub job_cost: f64,
    pub daily_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub queue_depth: usize,
    #[serde(default)]
    pub active_job_id: Option<String>,
    pub total_processed: u64,
    pub average_duration_seconds: f64,
    pub daily_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub priority: Priority,
    pub state: JobState,
    pub attempt: u32,
    pub caller_id: String,
    pub target: String,
    /// Remaining backoff before a waiting retry becomes eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_in_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub active: Option<QueueEntry>,
    pub queued: Vec<QueueEntry>,
}
