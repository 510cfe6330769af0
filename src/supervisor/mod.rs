//! Resource supervisor: runs exactly one runner process per attempt and
//! enforces its wall-clock deadline, stall detection and cancellation.

mod framework;
mod process;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use framework::{FrameworkRegistry, FrameworkSpec};
pub use process::{OutputCapture, classify_spawn_error, cpu_ticks, parse_stat_ticks};

use crate::config::SupervisorConfig;
use crate::parser::{ExitInfo, OutputFormat, clip};
use crate::state_machine::{FailureClassification, ResourceUsage};

/// How long to wait for the output pipes to close after the runner is gone.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for `RUNLANE_CONTEXT`; the kernel caps single env strings.
const CONTEXT_ENV_LIMIT: usize = 64 * 1024;

/// Everything needed to run one attempt.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job_id: String,
    pub attempt: u32,
    pub target: String,
    pub framework: String,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    /// Work description, including failure context from earlier attempts.
    pub context: String,
    pub cancel: CancellationToken,
}

/// Why the runner stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Exited(ExitInfo),
    TimedOut,
    Stalled { idle: Duration },
    Cancelled,
    SpawnFailed {
        classification: FailureClassification,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub termination: Termination,
    pub format: OutputFormat,
    pub output: String,
    pub output_truncated: bool,
    pub output_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub usage: ResourceUsage,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    frameworks: FrameworkRegistry,
    artifact_dir: PathBuf,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        frameworks: FrameworkRegistry,
        artifact_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            frameworks,
            artifact_dir,
        }
    }

    pub fn frameworks(&self) -> &FrameworkRegistry {
        &self.frameworks
    }

    pub fn artifact_path(&self, job_id: &str, attempt: u32) -> PathBuf {
        self.artifact_dir
            .join(job_id)
            .join(format!("attempt-{attempt}.log"))
    }

    /// Run one attempt to completion. Never fails: every way the runner can
    /// end, including not starting at all, is reported as a [`Termination`].
    pub async fn run(&self, req: &RunRequest) -> AttemptOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();

        let framework = match self.frameworks.get(&req.framework) {
            Ok(framework) => framework.clone(),
            Err(e) => {
                return self.spawn_failed(
                    req,
                    started_at,
                    FailureClassification::MissingDependency,
                    e.to_string(),
                    OutputFormat::Auto,
                );
            }
        };

        if let Some(dir) = &req.working_dir {
            if !dir.is_dir() {
                return self.spawn_failed(
                    req,
                    started_at,
                    FailureClassification::MissingDependency,
                    format!("working directory {} does not exist", dir.display()),
                    framework.format,
                );
            }
        }

        let args = framework.command_args(&req.target);
        let mut cmd = Command::new(&framework.program);
        cmd.args(&args)
            .envs(&framework.env)
            .env("RUNLANE_JOB_ID", &req.job_id)
            .env("RUNLANE_ATTEMPT", req.attempt.to_string())
            .env("RUNLANE_TARGET", &req.target)
            .env("RUNLANE_CONTEXT", clip(&req.context, CONTEXT_ENV_LIMIT))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &req.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            job_id = %req.job_id,
            attempt = req.attempt,
            program = %framework.program,
            args = ?args,
            "spawning runner"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let classification = classify_spawn_error(&e);
                warn!(
                    job_id = %req.job_id,
                    attempt = req.attempt,
                    error = %e,
                    %classification,
                    "failed to spawn runner"
                );
                return self.spawn_failed(
                    req,
                    started_at,
                    classification,
                    format!("failed to start `{}`: {e}", framework.program),
                    framework.format,
                );
            }
        };
        let pid = child.id();

        let capture = OutputCapture::new(self.config.max_output_bytes);
        let readers: Vec<_> = [
            child.stdout.take().map(|s| capture.spawn_reader(s)),
            child.stderr.take().map(|s| capture.spawn_reader(s)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let deadline = clock + req.timeout;
        let grace = self.config.grace_period();
        let stall_threshold = self.config.stall_threshold();
        let mut ticker = tokio::time::interval_at(
            clock + self.config.health_check_interval(),
            self.config.health_check_interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_progress = clock;
        let mut last_bytes = 0u64;
        let mut last_ticks: Option<u64> = None;

        let termination = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => Termination::Exited(exit_info(status)),
                        Err(e) => {
                            warn!(job_id = %req.job_id, error = %e, "failed to wait for runner");
                            Termination::Exited(ExitInfo { code: None, signal: None })
                        }
                    };
                }
                () = req.cancel.cancelled() => {
                    info!(
                        job_id = %req.job_id,
                        attempt = req.attempt,
                        "cancellation requested, stopping runner"
                    );
                    process::terminate_group(&mut child, pid, grace).await;
                    break Termination::Cancelled;
                }
                () = tokio::time::sleep_until(deadline) => {
                    warn!(
                        job_id = %req.job_id,
                        attempt = req.attempt,
                        timeout_secs = req.timeout.as_secs(),
                        "runner timed out"
                    );
                    process::terminate_group(&mut child, pid, grace).await;
                    break Termination::TimedOut;
                }
                now = ticker.tick() => {
                    let bytes = capture.bytes_seen();
                    let ticks = pid.and_then(cpu_ticks);
                    if bytes != last_bytes || (ticks.is_some() && ticks != last_ticks) {
                        last_progress = now;
                    }
                    last_bytes = bytes;
                    last_ticks = ticks.or(last_ticks);

                    let idle = now.saturating_duration_since(last_progress);
                    if idle >= stall_threshold {
                        warn!(
                            job_id = %req.job_id,
                            attempt = req.attempt,
                            idle_secs = idle.as_secs(),
                            "runner stalled"
                        );
                        process::terminate_group(&mut child, pid, grace).await;
                        break Termination::Stalled { idle };
                    }
                    debug!(
                        job_id = %req.job_id,
                        attempt = req.attempt,
                        elapsed_secs = clock.elapsed().as_secs(),
                        output_bytes = bytes,
                        "runner still running"
                    );
                }
            }
        };

        // Pipes close once the group is gone; don't wait forever on escapees.
        for reader in readers {
            match timeout(IO_CAPTURE_TIMEOUT, reader).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(job_id = %req.job_id, error = %e, "output capture failed"),
                Ok(Err(e)) => warn!(job_id = %req.job_id, error = %e, "output reader panicked"),
                Err(_) => warn!(job_id = %req.job_id, "output capture timed out"),
            }
        }

        let raw = capture.snapshot();
        let output_path = self.write_artifact(&req.job_id, req.attempt, &raw);
        let ended_at = Utc::now();

        AttemptOutcome {
            termination,
            format: framework.format,
            output: String::from_utf8_lossy(&raw).into_owned(),
            output_truncated: capture.truncated(),
            output_path,
            started_at,
            ended_at,
            usage: ResourceUsage {
                duration_ms: clock.elapsed().as_millis() as u64,
                output_bytes: capture.bytes_seen(),
                cpu_time_ms: last_ticks.map(process::ticks_to_ms),
            },
        }
    }

    fn spawn_failed(
        &self,
        req: &RunRequest,
        started_at: DateTime<Utc>,
        classification: FailureClassification,
        message: String,
        format: OutputFormat,
    ) -> AttemptOutcome {
        let output_path = self.write_artifact(&req.job_id, req.attempt, message.as_bytes());
        AttemptOutcome {
            termination: Termination::SpawnFailed {
                classification,
                message: message.clone(),
            },
            format,
            output: message,
            output_truncated: false,
            output_path,
            started_at,
            ended_at: Utc::now(),
            usage: ResourceUsage::default(),
        }
    }

    fn write_artifact(&self, job_id: &str, attempt: u32, raw: &[u8]) -> Option<PathBuf> {
        let path = self.artifact_path(job_id, attempt);
        match write_file(&path, raw) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(
                    job_id,
                    attempt,
                    path = %path.display(),
                    error = %e,
                    "failed to persist runner output"
                );
                None
            }
        }
    }
}

fn write_file(path: &Path, raw: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, raw)
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}
