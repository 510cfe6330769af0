//! The coordination core: owns the job table, the queue and the budget
//! ledger, and serializes the active slot.
//!
//! Lock order is always state, then ledger. Neither lock is held across an
//! await point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{
    CancelReceipt, CostReceipt, HealthReport, JobResult, JobStatus, QueueEntry, QueueSnapshot,
    SubmitReceipt,
};
use crate::budget::CostTracker;
use crate::config::{BudgetConfig, RunlaneConfig, ServerConfig};
use crate::error::{Result, RunlaneError};
use crate::git;
use crate::notify::{EVENT_CHANNEL_CAPACITY, JobEvent};
use crate::parser::{self, Diagnosis, classify_exit};
use crate::queue::JobQueue;
use crate::retry::{Decision, RetryPolicy};
use crate::state_machine::{
    AttemptRecord, AuditRecord, FailureClassification, FinalOutcome, Job, JobSpec, JobState,
    ResourceUsage, StateMachine,
};
use crate::supervisor::{AttemptOutcome, FrameworkRegistry, RunRequest, Supervisor, Termination};

/// Characters of runner output kept on the attempt record for hints.
const OUTPUT_TAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
struct ActiveSlot {
    job_id: String,
    cancel: CancellationToken,
    started: Instant,
}

#[derive(Debug, Default)]
struct Stats {
    total_processed: u64,
    attempts_measured: u64,
    total_attempt_ms: u64,
}

struct CoordinatorState {
    queue: JobQueue,
    jobs: HashMap<String, Job>,
    active: Option<ActiveSlot>,
    next_sequence: u64,
    stats: Stats,
    rng: StdRng,
}

impl CoordinatorState {
    fn average_duration(&self, fallback: Duration) -> Duration {
        if self.stats.attempts_measured == 0 {
            return fallback;
        }
        Duration::from_millis(self.stats.total_attempt_ms / self.stats.attempts_measured)
    }

    /// Remaining time of the active job plus one average run per job ahead.
    fn estimated_wait(&self, position: usize, fallback: Duration) -> Duration {
        let average = self.average_duration(fallback);
        let active_remaining = self
            .active
            .as_ref()
            .map(|slot| average.saturating_sub(slot.started.elapsed()))
            .unwrap_or_default();
        active_remaining + average * position.saturating_sub(1) as u32
    }

    fn entry(&self, job: &Job, now: Instant) -> QueueEntry {
        QueueEntry {
            job_id: job.id.clone(),
            position: self.queue.position(&job.id),
            priority: job.spec.priority,
            state: job.state,
            attempt: job.attempt,
            caller_id: job.spec.caller_id.clone(),
            target: job.spec.target.clone(),
            ready_in_seconds: self
                .queue
                .ready_at(&job.id)
                .filter(|at| *at > now)
                .map(|at| (at - now).as_secs_f64()),
        }
    }
}

/// How an attempt came to an end, as far as settling the job is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptEnd {
    Finished,
    /// A caller cancelled the job.
    Cancelled,
    /// The server shut down underneath the runner.
    Interrupted,
}

/// What the dispatcher should do next.
pub(super) enum Claim {
    Run(RunRequest),
    /// Only backed-off retries are waiting; the earliest is ready then.
    WaitUntil(Instant),
    Idle,
}

struct Inner {
    state: Mutex<CoordinatorState>,
    ledger: Mutex<CostTracker>,
    wake: Notify,
    events: broadcast::Sender<JobEvent>,
    supervisor: Supervisor,
    policy: RetryPolicy,
    budget: BudgetConfig,
    server: ServerConfig,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to the coordination core.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: &RunlaneConfig) -> Result<Self> {
        let supervisor = Supervisor::new(
            config.supervisor.clone(),
            FrameworkRegistry::with_overrides(&config.frameworks),
            config.server.artifact_dir.clone(),
        );
        let ledger = match &config.budget.ledger_path {
            Some(path) => CostTracker::with_ledger(config.budget.limits, path)?,
            None => CostTracker::new(config.budget.limits),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoordinatorState {
                    queue: JobQueue::new(config.server.max_queue_depth),
                    jobs: HashMap::new(),
                    active: None,
                    next_sequence: 0,
                    stats: Stats::default(),
                    rng: StdRng::from_entropy(),
                }),
                ledger: Mutex::new(ledger),
                wake: Notify::new(),
                events,
                supervisor,
                policy: config.retry,
                budget: config.budget.clone(),
                server: config.server.clone(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    // A panic elsewhere must not take the job table down with it.
    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ledger(&self) -> MutexGuard<'_, CostTracker> {
        self.inner.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(super) fn wake(&self) -> &Notify {
        &self.inner.wake
    }

    pub(super) fn retention(&self) -> Duration {
        Duration::from_secs(self.inner.server.retention_secs)
    }

    /// Stop dispatching and interrupt the active runner. The interrupted job
    /// settles as crashed, not cancelled.
    pub fn shutdown(&self) {
        info!("coordinator shutting down");
        self.inner.shutdown.cancel();
        if let Some(slot) = &self.state().active {
            slot.cancel.cancel();
        }
        self.inner.wake.notify_waiters();
    }

    pub fn submit(&self, spec: JobSpec) -> Result<SubmitReceipt> {
        validate_spec(&spec)?;
        self.inner.supervisor.frameworks().get(&spec.framework)?;

        let fallback = Duration::from_secs(self.inner.server.default_estimate_secs);
        let receipt = {
            let mut state = self.state();
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let job = Job::new(spec, sequence);
            let position = state.queue.enqueue(&job.id, job.spec.priority, sequence)?;
            let receipt = SubmitReceipt {
                job_id: job.id.clone(),
                queue_position: position,
                estimated_wait_seconds: state.estimated_wait(position, fallback).as_secs(),
            };
            state.jobs.insert(job.id.clone(), job);
            receipt
        };

        info!(
            job_id = %receipt.job_id,
            position = receipt.queue_position,
            "job queued"
        );
        self.publish(JobEvent::Queued {
            job_id: receipt.job_id.clone(),
            position: receipt.queue_position,
        });
        self.inner.wake.notify_one();
        Ok(receipt)
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus> {
        let state = self.state();
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| RunlaneError::JobNotFound(job_id.to_string()))?;

        let elapsed_seconds = match &state.active {
            Some(slot) if slot.job_id == job.id => Some(slot.started.elapsed().as_secs_f64()),
            _ if job.is_terminal() => job
                .started_at
                .zip(job.finished_at)
                .map(|(start, end)| (end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };

        Ok(JobStatus {
            job_id: job.id.clone(),
            state: job.state,
            attempt: job.attempt,
            priority: job.spec.priority,
            queue_position: state.queue.position(job_id),
            started_at: job.started_at,
            elapsed_seconds,
            timeout_secs: job.timeout_secs,
            cancel_requested: job.cancel_requested,
            outcome: job.outcome,
        })
    }

    pub fn result(&self, job_id: &str) -> Result<JobResult> {
        let state = self.state();
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| RunlaneError::JobNotFound(job_id.to_string()))?;
        if !job.is_terminal() {
            return Err(RunlaneError::NotReady {
                job_id: job.id.clone(),
                state: job.state,
            });
        }

        Ok(JobResult {
            job_id: job.id.clone(),
            state: job.state,
            outcome: job.outcome,
            result: job
                .last_attempt()
                .map(|a| a.result.clone())
                .unwrap_or_default(),
            attempts: job.attempts.clone(),
            cost: job.cost,
            description: job.description.clone(),
        })
    }

    /// Cancel a job. Queued jobs end immediately; a running job is flagged
    /// and its runner is stopped by the supervisor.
    pub fn cancel(&self, job_id: &str) -> Result<CancelReceipt> {
        let (receipt, event) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| RunlaneError::JobNotFound(job_id.to_string()))?;

            if job.is_terminal() {
                return Err(RunlaneError::AlreadyTerminal {
                    job_id: job.id.clone(),
                    state: job.state,
                });
            }

            job.cancel_requested = true;
            let was_running = job.state == JobState::Running;
            let event = if was_running {
                if let Some(slot) = state.active.as_ref().filter(|s| s.job_id == job_id) {
                    slot.cancel.cancel();
                }
                None
            } else {
                let _ = state.queue.remove(job_id);
                Some(finalize(job, FinalOutcome::Cancelled, &mut state.stats))
            };

            let receipt = CancelReceipt {
                job_id: job.id.clone(),
                state: JobState::Cancelled,
                was_running,
            };
            (receipt, event)
        };

        info!(job_id, was_running = receipt.was_running, "job cancellation requested");
        if let Some(event) = event {
            self.publish(event);
        }
        Ok(receipt)
    }

    /// Charge external spend (the calling agent's own cost) to a job.
    pub fn report_cost(&self, job_id: &str, amount: f64) -> Result<CostReceipt> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(RunlaneError::InvalidRequest(
                "cost amount must be a non-negative number".to_string(),
            ));
        }

        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RunlaneError::JobNotFound(job_id.to_string()))?;
        let mut ledger = self.ledger();
        ledger.record_attempt(job_id, amount);
        job.cost += amount;
        debug!(job_id, amount, job_cost = job.cost, "external cost reported");

        Ok(CostReceipt {
            job_id: job.id.clone(),
            job_cost: job.cost,
            daily_cost: ledger.daily_total(),
        })
    }

    pub fn health(&self) -> HealthReport {
        let fallback = Duration::from_secs(self.inner.server.default_estimate_secs);
        let state = self.state();
        let daily_cost = self.ledger().daily_total();
        HealthReport {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            queue_depth: state.queue.len(),
            active_job_id: state.active.as_ref().map(|s| s.job_id.clone()),
            total_processed: state.stats.total_processed,
            average_duration_seconds: state.average_duration(fallback).as_secs_f64(),
            daily_cost,
        }
    }

    pub fn queue(&self) -> QueueSnapshot {
        let state = self.state();
        let now = Instant::now();
        let active = state
            .active
            .as_ref()
            .and_then(|slot| state.jobs.get(&slot.job_id))
            .map(|job| state.entry(job, now));
        let queued = state
            .queue
            .ids()
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(|job| state.entry(job, now))
            .collect();
        QueueSnapshot { active, queued }
    }

    /// Drop terminal jobs finished more than the retention window before `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(self.inner.server.retention_secs as i64);
        let expired: Vec<String> = {
            let mut state = self.state();
            let expired: Vec<String> = state
                .jobs
                .values()
                .filter(|job| job.is_terminal())
                .filter(|job| job.finished_at.is_some_and(|at| now - at >= retention))
                .map(|job| job.id.clone())
                .collect();
            for id in &expired {
                state.jobs.remove(id);
            }
            expired
        };

        if !expired.is_empty() {
            let mut ledger = self.ledger();
            for id in &expired {
                ledger.forget(id);
            }
            debug!(count = expired.len(), "purged expired jobs");
        }
        expired.len()
    }

    /// Move the best ready job into the active slot.
    pub(super) fn claim_next(&self) -> Claim {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.active.is_some() {
            return Claim::Idle;
        }

        let now = Instant::now();
        let claimed = loop {
            let Some(job_id) = state.queue.pop_next(now) else {
                break None;
            };
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if let Err(e) = StateMachine::transition(job, JobState::Running) {
                warn!(job_id = %job_id, error = %e, "skipping queued job");
                continue;
            }
            job.started_at.get_or_insert_with(Utc::now);

            let cancel = CancellationToken::new();
            state.active = Some(ActiveSlot {
                job_id: job_id.clone(),
                cancel: cancel.clone(),
                started: now,
            });
            break Some(RunRequest {
                job_id,
                attempt: job.attempt,
                target: job.spec.target.clone(),
                framework: job.spec.framework.clone(),
                working_dir: job.spec.working_dir.clone(),
                timeout: Duration::from_secs(job.timeout_secs),
                context: job.description.clone(),
                cancel,
            });
        };

        let Some(request) = claimed else {
            return match state.queue.next_ready_at() {
                Some(at) => Claim::WaitUntil(at),
                None => Claim::Idle,
            };
        };
        drop(guard);

        info!(job_id = %request.job_id, attempt = request.attempt, "job started");
        self.publish(JobEvent::Started {
            job_id: request.job_id.clone(),
            attempt: request.attempt,
        });
        Claim::Run(request)
    }

    /// Run a claimed attempt to the end and settle the job.
    pub(super) async fn run_claimed(&self, request: RunRequest) {
        let (record, retry_after, end) = match self.preflight(&request).await {
            Some(record) => (record, None, AttemptEnd::Finished),
            None => {
                let outcome = self.inner.supervisor.run(&request).await;
                self.assess(&request, outcome)
            }
        };
        self.conclude(&request.job_id, record, retry_after, end);
    }

    async fn preflight(&self, request: &RunRequest) -> Option<AttemptRecord> {
        let dir = match &request.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().ok()?,
        };
        let started_at = Utc::now();
        match tokio::task::spawn_blocking(move || git::preflight(&dir)).await {
            Ok(Ok(paths)) if paths.is_empty() => None,
            Ok(Ok(paths)) => {
                warn!(
                    job_id = %request.job_id,
                    conflicted = ?paths,
                    "working tree has merge conflicts"
                );
                Some(synthetic_record(
                    request,
                    started_at,
                    FailureClassification::GitConflict,
                    format!("unresolved merge conflicts in {}", paths.join(", ")),
                ))
            }
            Ok(Err(e)) => {
                debug!(job_id = %request.job_id, error = %e, "git preflight skipped");
                None
            }
            Err(e) => {
                warn!(job_id = %request.job_id, error = %e, "git preflight task failed");
                None
            }
        }
    }

    /// Turn a supervised run into an attempt record.
    fn assess(
        &self,
        request: &RunRequest,
        outcome: AttemptOutcome,
    ) -> (AttemptRecord, Option<Duration>, AttemptEnd) {
        let parsed = parser::parse(&outcome.output, outcome.format);
        let mut end = AttemptEnd::Finished;
        let mut exit_code = None;

        let diagnosis = match &outcome.termination {
            Termination::Exited(exit) => {
                exit_code = exit.code;
                classify_exit(*exit, &parsed, outcome.format, &outcome.output)
            }
            Termination::TimedOut => Some(Diagnosis::new(
                FailureClassification::Timeout,
                format!("runner exceeded its {}s timeout", request.timeout.as_secs()),
            )),
            Termination::Stalled { idle } => Some(Diagnosis::new(
                FailureClassification::RuntimeCrash,
                format!(
                    "runner stalled: no output or CPU progress for {}s",
                    idle.as_secs()
                ),
            )),
            Termination::Cancelled if self.cancel_requested(&request.job_id) => {
                end = AttemptEnd::Cancelled;
                None
            }
            Termination::Cancelled => {
                end = AttemptEnd::Interrupted;
                Some(Diagnosis::new(
                    FailureClassification::RuntimeCrash,
                    "runner interrupted by server shutdown",
                ))
            }
            Termination::SpawnFailed {
                classification,
                message,
            } => Some(Diagnosis::new(*classification, message.clone())),
        };

        let mut result = parsed.unwrap_or_default();
        if outcome.output_truncated {
            result.truncated = true;
        }
        let cost = outcome.usage.duration_ms as f64 / 1000.0
            * self.inner.budget.cost_per_runtime_second;
        let retry_after = diagnosis.as_ref().and_then(|d| d.retry_after);
        let message = match (&diagnosis, end) {
            (Some(d), _) => Some(d.message.clone()),
            (None, AttemptEnd::Cancelled) => Some("cancelled by caller".to_string()),
            (None, _) => None,
        };

        let record = AttemptRecord {
            number: request.attempt,
            started_at: outcome.started_at,
            ended_at: outcome.ended_at,
            timeout_secs: request.timeout.as_secs(),
            classification: diagnosis.map(|d| d.classification),
            message,
            exit_code,
            output_path: outcome.output_path,
            output_tail: tail(&outcome.output, OUTPUT_TAIL_CHARS),
            result,
            usage: outcome.usage,
            cost,
        };
        (record, retry_after, end)
    }

    fn cancel_requested(&self, job_id: &str) -> bool {
        self.state()
            .jobs
            .get(job_id)
            .is_some_and(|job| job.cancel_requested)
    }

    /// Record the attempt, charge it, and either requeue or finalize the job.
    fn conclude(
        &self,
        job_id: &str,
        record: AttemptRecord,
        retry_after: Option<Duration>,
        end: AttemptEnd,
    ) {
        let mut events = Vec::new();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            state.active = None;
            state.stats.attempts_measured += 1;
            state.stats.total_attempt_ms += record.usage.duration_ms;

            let Some(job) = state.jobs.get_mut(job_id) else {
                warn!(job_id, "finished attempt for unknown job");
                return;
            };
            let mut ledger = self.ledger();
            ledger.record_attempt(job_id, record.cost);
            job.cost += record.cost;
            job.attempts.push(record.clone());

            info!(
                job_id,
                attempt = record.number,
                classification = record.classification.map(|c| c.as_str()).unwrap_or("none"),
                duration_ms = record.usage.duration_ms,
                "attempt finished"
            );

            if end == AttemptEnd::Cancelled || job.cancel_requested {
                events.push(finalize(job, FinalOutcome::Cancelled, &mut state.stats));
            } else if end == AttemptEnd::Interrupted {
                // No dispatcher is left to run a retry.
                let outcome = FinalOutcome::Failed {
                    classification: FailureClassification::RuntimeCrash,
                };
                events.push(finalize(job, outcome, &mut state.stats));
            } else {
                let decision = self.inner.policy.decide(
                    job,
                    &record,
                    retry_after,
                    &ledger,
                    &self.inner.budget.limits,
                    &mut state.rng,
                );
                match decision {
                    Decision::Retry { delay } => {
                        if let Err(e) = StateMachine::transition(job, JobState::Queued) {
                            warn!(job_id, error = %e, "could not requeue job");
                        }
                        state.queue.requeue(
                            job_id,
                            job.spec.priority,
                            job.sequence,
                            Instant::now() + delay,
                        );
                        events.push(JobEvent::RetryScheduled {
                            job_id: job_id.to_string(),
                            next_attempt: job.attempt,
                            classification: record
                                .classification
                                .unwrap_or(FailureClassification::Unknown),
                            delay_ms: delay.as_millis() as u64,
                        });
                    }
                    Decision::Stop(outcome) => {
                        events.push(finalize(job, outcome, &mut state.stats));
                    }
                }
            }
        }

        for event in events {
            self.publish(event);
        }
        self.inner.wake.notify_one();
    }

    /// Settle the job left in the active slot by a dispatcher that panicked.
    pub(super) fn recover_active(&self) {
        let slot = self.state().active.clone();
        let Some(slot) = slot else { return };
        slot.cancel.cancel();

        let record = {
            let state = self.state();
            match state.jobs.get(&slot.job_id) {
                Some(job) if job.state == JobState::Running => {
                    let request = RunRequest {
                        job_id: job.id.clone(),
                        attempt: job.attempt,
                        target: job.spec.target.clone(),
                        framework: job.spec.framework.clone(),
                        working_dir: job.spec.working_dir.clone(),
                        timeout: Duration::from_secs(job.timeout_secs),
                        context: String::new(),
                        cancel: slot.cancel.clone(),
                    };
                    Some(synthetic_record(
                        &request,
                        Utc::now(),
                        FailureClassification::RuntimeCrash,
                        "dispatcher crashed during the attempt".to_string(),
                    ))
                }
                _ => None,
            }
        };

        match record {
            Some(record) => self.conclude(&slot.job_id, record, None, AttemptEnd::Finished),
            None => self.state().active = None,
        }
    }

    /// Artifact directory runner output is persisted under.
    pub fn artifact_path(&self, job_id: &str, attempt: u32) -> PathBuf {
        self.inner.supervisor.artifact_path(job_id, attempt)
    }
}

fn validate_spec(spec: &JobSpec) -> Result<()> {
    if spec.target.trim().is_empty() {
        return Err(RunlaneError::InvalidRequest("target must not be empty".to_string()));
    }
    if spec.framework.trim().is_empty() {
        return Err(RunlaneError::InvalidRequest("framework must not be empty".to_string()));
    }
    if spec.timeout_secs == 0 {
        return Err(RunlaneError::InvalidRequest(
            "timeout_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Move `job` to its terminal state and build the notification for it.
fn finalize(job: &mut Job, outcome: FinalOutcome, stats: &mut Stats) -> JobEvent {
    let target = outcome.terminal_state();
    if let Err(e) = StateMachine::transition(job, target) {
        warn!(job_id = %job.id, error = %e, "forcing terminal state");
        job.state_history.push(job.state);
        job.state = target;
    }
    job.outcome = Some(outcome);
    job.finished_at = Some(Utc::now());
    stats.total_processed += 1;

    info!(
        job_id = %job.id,
        state = %job.state,
        %outcome,
        attempts = job.attempts.len(),
        cost = job.cost,
        "job finished"
    );
    JobEvent::Finished {
        record: AuditRecord::from_job(job),
    }
}

fn synthetic_record(
    request: &RunRequest,
    started_at: DateTime<Utc>,
    classification: FailureClassification,
    message: String,
) -> AttemptRecord {
    AttemptRecord {
        number: request.attempt,
        started_at,
        ended_at: Utc::now(),
        timeout_secs: request.timeout.as_secs(),
        classification: Some(classification),
        output_tail: message.clone(),
        message: Some(message),
        exit_code: None,
        output_path: None,
        result: Default::default(),
        usage: ResourceUsage::default(),
        cost: 0.0,
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}
