//! End-to-end runs through a real coordinator with shell-script runners.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use runlane::config::RunlaneConfig;
use runlane::notify::JobEvent;
use runlane::parser::OutputFormat;
use runlane::retry::Backoff;
use runlane::server::Coordinator;
use runlane::server::types::JobStatus;
use runlane::state_machine::{FailureClassification, FinalOutcome, JobSpec, JobState};
use runlane::supervisor::FrameworkSpec;
use runlane::RunlaneError;

struct Harness {
    dir: TempDir,
    coordinator: Coordinator,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(tweak: impl FnOnce(&mut RunlaneConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = RunlaneConfig::default();
        config.server.artifact_dir = dir.path().join("artifacts");
        config.supervisor.grace_period_ms = 200;
        config.supervisor.health_check_interval_ms = 50;
        config.supervisor.stall_threshold_secs = 60;
        config.retry.backoff = Backoff {
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter_ratio: 0.0,
        };
        tweak(&mut config);
        let coordinator = Coordinator::new(&config).unwrap();
        Self { dir, coordinator }
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn spec(&self, script: &Path, framework: &str) -> JobSpec {
        let mut spec = JobSpec::new(script.display().to_string(), framework);
        spec.working_dir = Some(self.dir.path().to_path_buf());
        spec.timeout_secs = 10;
        spec
    }

    async fn wait_terminal(&self, job_id: &str) -> JobStatus {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let status = self.coordinator.status(job_id).unwrap();
                if status.state.is_terminal() {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("job did not finish in time")
    }

    async fn wait_state(&self, job_id: &str, state: JobState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.coordinator.status(job_id).unwrap().state != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job never reached the expected state");
    }
}

const FIVE_PASSING: &str = r#"
for name in alpha beta gamma delta epsilon; do
  echo "{\"type\":\"test\",\"name\":\"$name\",\"status\":\"passed\"}"
done
echo '{"type":"summary","total":5,"passed":5,"failed":0,"skipped":0}'
"#;

#[tokio::test]
async fn passing_suite_completes_first_try() {
    let h = Harness::new();
    let workers = h.coordinator.start();
    let script = h.script("pass.sh", FIVE_PASSING);

    let receipt = h.coordinator.submit(h.spec(&script, "jsonl")).unwrap();
    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::Completed);

    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(result.outcome, Some(FinalOutcome::Succeeded));
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.result.summary.total, 5);
    assert_eq!(result.result.summary.passed, 5);
    assert_eq!(result.result.summary.failed, 0);

    let artifact = result.attempts[0].output_path.clone().unwrap();
    assert!(std::fs::read_to_string(artifact).unwrap().contains("epsilon"));

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn failing_tests_retry_with_context() {
    let h = Harness::new();
    let workers = h.coordinator.start();
    let script = h.script(
        "flaky.sh",
        r#"
n=$(cat count 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > count
if [ "$n" -lt 2 ]; then
  echo '{"type":"test","name":"checkout_total","status":"failed","expected":"200","actual":"500"}'
  echo '{"type":"test","name":"refund_flow","status":"failed"}'
  echo '{"type":"test","name":"login","status":"passed"}'
  echo '{"type":"summary","total":3,"passed":1,"failed":2,"skipped":0}'
  exit 1
fi
echo '{"type":"test","name":"checkout_total","status":"passed"}'
echo '{"type":"test","name":"refund_flow","status":"passed"}'
echo '{"type":"test","name":"login","status":"passed"}'
echo '{"type":"summary","total":3,"passed":3,"failed":0,"skipped":0}'
"#,
    );

    let mut spec = h.spec(&script, "jsonl");
    spec.description = "Fix the checkout totals".to_string();
    let receipt = h.coordinator.submit(spec).unwrap();
    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::Completed);

    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(
        result.attempts[0].classification,
        Some(FailureClassification::TestFailure)
    );
    assert!(result.attempts[1].succeeded());
    assert_eq!(result.result.summary.failed, 0);

    assert!(result.description.starts_with("Fix the checkout totals"));
    assert!(result.description.contains("Attempt 1 failed: test_failure"));
    assert!(result.description.contains("checkout_total"));
    assert!(result.description.contains("expected 200, got 500"));

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn hanging_runner_times_out_after_one_extension() {
    let h = Harness::new();
    let workers = h.coordinator.start();
    let script = h.script("hang.sh", "sleep 30\n");

    let mut spec = h.spec(&script, "shell");
    spec.timeout_secs = 1;
    let receipt = h.coordinator.submit(spec).unwrap();
    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::TimedOut);

    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(
        result.outcome,
        Some(FinalOutcome::Failed {
            classification: FailureClassification::Timeout
        })
    );
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(result.attempts[0].timeout_secs, 1);
    assert!(result.attempts[1].timeout_secs > 1);
    assert!(
        result
            .attempts
            .iter()
            .all(|a| a.classification == Some(FailureClassification::Timeout))
    );

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn missing_dependency_is_fatal_regardless_of_max_retries() {
    let h = Harness::new();
    let workers = h.coordinator.start();
    let script = h.script(
        "missing.sh",
        "echo 'sh: 1: pytest-xdist: command not found' >&2\nexit 127\n",
    );

    let mut spec = h.spec(&script, "shell");
    spec.max_retries = Some(5);
    let receipt = h.coordinator.submit(spec).unwrap();
    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);

    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(
        result.outcome,
        Some(FinalOutcome::Failed {
            classification: FailureClassification::MissingDependency
        })
    );
    assert!(
        result.attempts[0]
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("command not found")
    );

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn missing_runner_binary_is_fatal() {
    let h = Harness::with_config(|config| {
        config.frameworks.insert(
            "ghost".to_string(),
            FrameworkSpec::new("runlane-no-such-runner", &["{target}"], OutputFormat::Auto),
        );
    });
    let workers = h.coordinator.start();
    let script = h.script("unused.sh", "exit 0\n");

    let mut spec = h.spec(&script, "ghost");
    spec.max_retries = Some(5);
    let receipt = h.coordinator.submit(spec).unwrap();
    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);

    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(
        result.attempts[0].classification,
        Some(FailureClassification::MissingDependency)
    );

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn full_queue_rejects_the_fifty_first() {
    // No dispatcher: everything stays queued.
    let h = Harness::new();
    let script = h.script("pass.sh", FIVE_PASSING);

    for _ in 0..50 {
        h.coordinator.submit(h.spec(&script, "jsonl")).unwrap();
    }
    let err = h.coordinator.submit(h.spec(&script, "jsonl")).unwrap_err();
    assert!(matches!(err, RunlaneError::QueueFull { max_depth: 50 }));
    assert_eq!(h.coordinator.health().queue_depth, 50);
    assert_eq!(h.coordinator.queue().queued.len(), 50);
}

#[tokio::test]
async fn one_job_runs_at_a_time() {
    let h = Harness::new();
    let mut events = h.coordinator.subscribe();
    let script = h.script("quick.sh", "sleep 0.2\n");

    let ids: Vec<String> = (0..3)
        .map(|_| h.coordinator.submit(h.spec(&script, "shell")).unwrap().job_id)
        .collect();
    let workers = h.coordinator.start();
    for id in &ids {
        h.wait_terminal(id).await;
    }

    let mut running: Option<String> = None;
    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            JobEvent::Started { job_id, .. } => {
                assert!(running.is_none(), "two jobs running at once");
                started.push(job_id.clone());
                running = Some(job_id);
            }
            JobEvent::Finished { record } => {
                assert_eq!(running.take().as_deref(), Some(record.job_id.as_str()));
            }
            JobEvent::Queued { .. } | JobEvent::RetryScheduled { .. } => {}
        }
    }
    assert_eq!(started, ids);

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn cancelling_a_running_job() {
    let h = Harness::new();
    let workers = h.coordinator.start();
    let script = h.script("slow.sh", "sleep 30\n");

    let receipt = h.coordinator.submit(h.spec(&script, "shell")).unwrap();
    h.wait_state(&receipt.job_id, JobState::Running).await;

    let cancel = h.coordinator.cancel(&receipt.job_id).unwrap();
    assert!(cancel.was_running);

    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(status.outcome, Some(FinalOutcome::Cancelled));
    assert_eq!(h.coordinator.result(&receipt.job_id).unwrap().attempts.len(), 1);

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn polling_does_not_change_state() {
    let h = Harness::new();
    let script = h.script("pass.sh", FIVE_PASSING);
    let receipt = h.coordinator.submit(h.spec(&script, "jsonl")).unwrap();

    for _ in 0..5 {
        assert_eq!(
            h.coordinator.status(&receipt.job_id).unwrap().state,
            JobState::Queued
        );
        assert!(h.coordinator.result(&receipt.job_id).is_err());
    }
    assert_eq!(h.coordinator.health().total_processed, 0);
}

#[tokio::test]
async fn per_task_budget_stops_retries() {
    let h = Harness::with_config(|config| {
        config.budget.limits.per_task_limit = Some(1.0);
    });
    let script = h.script(
        "fail.sh",
        "echo '{\"type\":\"summary\",\"total\":1,\"passed\":0,\"failed\":1}'\nexit 1\n",
    );

    let receipt = h.coordinator.submit(h.spec(&script, "jsonl")).unwrap();
    // The caller's own spend already exhausts the task budget.
    h.coordinator.report_cost(&receipt.job_id, 2.0).unwrap();
    let workers = h.coordinator.start();

    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(
        result.outcome,
        Some(FinalOutcome::BudgetExceeded {
            classification: FailureClassification::TestFailure
        })
    );

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn plain_shell_script_succeeds_on_clean_exit() {
    let h = Harness::new();
    let workers = h.coordinator.start();
    let script = h.script("deploy.sh", "echo 'migrations applied'\nexit 0\n");

    let receipt = h.coordinator.submit(h.spec(&script, "shell")).unwrap();
    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::Completed);

    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(result.outcome, Some(FinalOutcome::Succeeded));
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].classification, None);
    assert_eq!(result.attempts[0].exit_code, Some(0));

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn stalled_runner_crashes_after_three_attempts() {
    let h = Harness::with_config(|config| {
        config.supervisor.stall_threshold_secs = 1;
    });
    let workers = h.coordinator.start();
    let script = h.script("stuck.sh", "sleep 30\n");

    let receipt = h.coordinator.submit(h.spec(&script, "shell")).unwrap();
    let status = h.wait_terminal(&receipt.job_id).await;
    assert_eq!(status.state, JobState::Crashed);

    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(
        result.outcome,
        Some(FinalOutcome::Failed {
            classification: FailureClassification::RuntimeCrash
        })
    );
    assert_eq!(result.attempts.len(), 3);
    for attempt in &result.attempts {
        assert_eq!(attempt.classification, Some(FailureClassification::RuntimeCrash));
        assert!(attempt.message.as_deref().unwrap().contains("stalled"));
    }

    h.coordinator.shutdown();
    workers.join().await;
}

#[tokio::test]
async fn shutdown_settles_running_job_as_crashed() {
    let h = Harness::new();
    let mut events = h.coordinator.subscribe();
    let workers = h.coordinator.start();
    let script = h.script("slow.sh", "sleep 30\n");

    let receipt = h.coordinator.submit(h.spec(&script, "shell")).unwrap();
    h.wait_state(&receipt.job_id, JobState::Running).await;

    h.coordinator.shutdown();
    tokio::time::timeout(Duration::from_secs(10), workers.join())
        .await
        .expect("workers did not stop");

    let status = h.coordinator.status(&receipt.job_id).unwrap();
    assert_eq!(status.state, JobState::Crashed);
    assert!(!status.cancel_requested);
    assert_eq!(
        status.outcome,
        Some(FinalOutcome::Failed {
            classification: FailureClassification::RuntimeCrash
        })
    );
    let result = h.coordinator.result(&receipt.job_id).unwrap();
    assert_eq!(result.attempts.len(), 1);
    assert!(
        result.attempts[0]
            .message
            .as_deref()
            .unwrap()
            .contains("server shutdown")
    );

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::Finished { record } = event {
            finished = Some(record);
        }
    }
    let record = finished.expect("terminal state was not published");
    assert_eq!(record.job_id, receipt.job_id);
    assert_eq!(record.state, JobState::Crashed);
}
