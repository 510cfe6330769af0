//! Terminal output for the CLI: a spinner while waiting on a job and
//! coloured result summaries.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::server::types::{JobResult, JobStatus};
use crate::state_machine::{FinalOutcome, JobState};

/// Spinner shown by `runlane wait` and `runlane submit --wait`.
pub struct JobProgress {
    pb: ProgressBar,
    yellow: Style,
    last_attempt: u32,
}

impl JobProgress {
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("waiting on {job_id}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            yellow: Style::new().yellow(),
            last_attempt: 1,
        }
    }

    /// Refresh the spinner from a status poll, noting each new attempt.
    pub fn update(&mut self, status: &JobStatus) {
        if status.attempt > self.last_attempt {
            self.pb.println(format!(
                "  {} retrying, attempt {}",
                self.yellow.apply_to("↻"),
                status.attempt
            ));
            self.last_attempt = status.attempt;
        }
        self.pb.set_message(status_line(status));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

/// One-line description of where a job stands.
pub fn status_line(status: &JobStatus) -> String {
    match status.state {
        JobState::Queued => match status.queue_position {
            Some(position) => format!("{} queued at position {position}", status.job_id),
            None => format!("{} queued", status.job_id),
        },
        JobState::Running => format!(
            "{} running attempt {} ({:.1}s of {}s)",
            status.job_id,
            status.attempt,
            status.elapsed_seconds.unwrap_or_default(),
            status.timeout_secs
        ),
        state => format!("{} {state}", status.job_id),
    }
}

/// Headline for a finished job, coloured by outcome.
pub fn outcome_line(result: &JobResult) -> String {
    let summary = result.result.summary;
    let counts = format!(
        "{} passed, {} failed, {} skipped of {}",
        summary.passed, summary.failed, summary.skipped, summary.total
    );
    let attempts = result.attempts.len();
    match result.outcome {
        Some(FinalOutcome::Succeeded) => format!(
            "{} {} after {attempts} attempt(s): {counts}",
            Style::new().green().bold().apply_to("✓"),
            result.state
        ),
        Some(FinalOutcome::Cancelled) => format!(
            "{} {} after {attempts} attempt(s)",
            Style::new().yellow().apply_to("■"),
            result.state
        ),
        Some(outcome) => format!(
            "{} {} ({outcome}) after {attempts} attempt(s): {counts}",
            Style::new().red().bold().apply_to("✗"),
            result.state
        ),
        None => format!("{} {}", result.job_id, result.state),
    }
}

pub fn print_result(result: &JobResult) {
    println!("{}", outcome_line(result));
    let dim = Style::new().dim();
    for attempt in &result.attempts {
        let reason = match (attempt.classification, &attempt.message) {
            (Some(c), Some(message)) => format!("{c}: {message}"),
            (Some(c), None) => c.to_string(),
            (None, _) => "passed".to_string(),
        };
        println!(
            "  {} {reason}",
            dim.apply_to(format!("attempt {}:", attempt.number))
        );
    }
    for test in result.result.failing_tests() {
        println!("  {} {}", Style::new().red().apply_to("FAIL"), test.name);
    }
    if result.cost > 0.0 {
        println!("  {}", dim.apply_to(format!("cost {:.4}", result.cost)));
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}
