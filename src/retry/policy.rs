use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::backoff::Backoff;
use super::context::{FailureSummary, append_context};
use crate::budget::{BudgetLimits, CostTracker};
use crate::state_machine::{AttemptRecord, FailureClassification, FinalOutcome, Job, JobSpec};

/// What happens to a job after an attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Requeue after `delay`. The job has already been updated for the next attempt.
    Retry { delay: Duration },
    Stop(FinalOutcome),
}

fn default_timeout_growth() -> f64 {
    2.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(flatten)]
    pub backoff: Backoff,
    /// Multiplier applied once to the timeout after a timed-out attempt.
    #[serde(default = "default_timeout_growth")]
    pub timeout_growth: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            timeout_growth: default_timeout_growth(),
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            ..Default::default()
        }
    }

    /// Additional attempts allowed for a classification before caller overrides.
    pub fn default_ceiling(classification: FailureClassification) -> u32 {
        match classification {
            FailureClassification::TestFailure => 3,
            FailureClassification::CompilationError => 3,
            FailureClassification::RuntimeCrash => 2,
            FailureClassification::Timeout => 1,
            FailureClassification::GitConflict => 1,
            FailureClassification::RateLimited => 5,
            FailureClassification::PermissionError => 0,
            FailureClassification::MissingDependency => 0,
            FailureClassification::ResourceExhausted => 0,
            FailureClassification::Unknown => 1,
        }
    }

    /// Ceiling after applying the caller's overrides, which can only narrow it.
    pub fn effective_ceiling(spec: &JobSpec, classification: FailureClassification) -> u32 {
        let mut ceiling = Self::default_ceiling(classification);
        if let Some(allowed) = &spec.allow_retry_on {
            if !allowed.contains(&classification) {
                return 0;
            }
        }
        if let Some(max) = spec.max_retries {
            ceiling = ceiling.min(max);
        }
        ceiling
    }

    /// Decide the fate of `job` after `record`, the attempt that just ended.
    ///
    /// On [`Decision::Retry`] the job is updated in place: failure context is
    /// appended to its description, the attempt counter moves on, and a
    /// timed-out job gets its one timeout extension.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        job: &mut Job,
        record: &AttemptRecord,
        retry_after: Option<Duration>,
        budget: &CostTracker,
        limits: &BudgetLimits,
        rng: &mut R,
    ) -> Decision {
        let Some(classification) = record.classification else {
            return Decision::Stop(FinalOutcome::Succeeded);
        };

        let ceiling = Self::effective_ceiling(&job.spec, classification);
        if job.retries_used() >= ceiling {
            info!(
                job_id = %job.id,
                attempt = record.number,
                %classification,
                ceiling,
                "retry ceiling reached"
            );
            return Decision::Stop(FinalOutcome::Failed { classification });
        }

        if !budget.can_retry(&job.id, limits.per_task_limit, limits.daily_limit) {
            warn!(
                job_id = %job.id,
                attempt = record.number,
                job_cost = budget.job_cost(&job.id),
                "budget exhausted, not retrying"
            );
            return Decision::Stop(FinalOutcome::BudgetExceeded { classification });
        }

        let summary = FailureSummary::from_attempt(record, classification);
        job.description = append_context(&job.description, &summary);

        let delay = match (classification, retry_after) {
            (FailureClassification::RateLimited, Some(wait)) => wait,
            _ => self.backoff.delay(job.attempt, rng),
        };

        if classification == FailureClassification::Timeout && !job.timeout_extended {
            let grown = (job.timeout_secs as f64 * self.timeout_growth.max(1.0)).ceil() as u64;
            job.timeout_secs = grown.max(job.timeout_secs + 1);
            job.timeout_extended = true;
        }

        job.attempt += 1;
        warn!(
            job_id = %job.id,
            next_attempt = job.attempt,
            %classification,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        Decision::Retry { delay }
    }
}
