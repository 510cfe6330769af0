//! Command-line interface of `runlane`, built on clap.
//!
//! `serve` runs the coordination server; every other subcommand is a thin
//! client of its HTTP API.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::client::DEFAULT_URL;
use crate::state_machine::{FailureClassification, JobSpec, Priority};

/// runlane: single-lane test coordination server for coding agents.
#[derive(Debug, Parser)]
#[command(name = "runlane", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (defaults to ./runlane.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address for client subcommands.
    #[arg(long, global = true, env = "RUNLANE_URL", default_value = DEFAULT_URL)]
    pub url: String,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the coordination server.
    Serve {
        /// Listen address, overriding the config file.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Submit a test job.
    Submit(SubmitArgs),

    /// Show the state of a job.
    Status { job_id: String },

    /// Show the result of a finished job.
    Result {
        job_id: String,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Cancel a queued or running job.
    Cancel { job_id: String },

    /// List the active job and the queue.
    Queue,

    /// Show server health.
    Health,

    /// Block until a job finishes, then print its result.
    Wait {
        job_id: String,

        /// Seconds between status polls.
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
    },
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Path or selector handed to the framework runner.
    pub target: String,

    /// Framework id (cargo, pytest, jest, shell, jsonl or a configured one).
    #[arg(long, short, default_value = "shell")]
    pub framework: String,

    /// Per-attempt timeout in seconds.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    #[arg(long, default_value = "normal")]
    pub priority: Priority,

    /// Identifier of the submitting agent.
    #[arg(long, default_value = "cli")]
    pub caller: String,

    /// Cap on additional attempts.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Only retry on these classifications (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub allow_retry_on: Vec<FailureClassification>,

    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Description of the work under test.
    #[arg(long, short, default_value = "")]
    pub description: String,

    /// Wait for the job to finish and print its result.
    #[arg(long)]
    pub wait: bool,
}

impl SubmitArgs {
    pub fn to_spec(&self) -> JobSpec {
        let mut spec = JobSpec::new(self.target.clone(), self.framework.clone());
        spec.timeout_secs = self.timeout;
        spec.priority = self.priority;
        spec.caller_id = self.caller.clone();
        spec.max_retries = self.max_retries;
        if !self.allow_retry_on.is_empty() {
            spec.allow_retry_on = Some(self.allow_retry_on.clone());
        }
        spec.working_dir = self.working_dir.clone();
        spec.description = self.description.clone();
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_submit() {
        let cli = Cli::parse_from([
            "runlane",
            "submit",
            "tests/test_api.py",
            "--framework",
            "pytest",
            "--timeout",
            "30",
            "--priority",
            "high",
            "--allow-retry-on",
            "test-failure,timeout",
            "--wait",
        ]);
        match cli.command {
            Command::Submit(args) => {
                assert!(args.wait);
                let spec = args.to_spec();
                assert_eq!(spec.target, "tests/test_api.py");
                assert_eq!(spec.framework, "pytest");
                assert_eq!(spec.timeout_secs, 30);
                assert_eq!(spec.priority, Priority::High);
                assert_eq!(spec.caller_id, "cli");
                assert_eq!(
                    spec.allow_retry_on,
                    Some(vec![
                        FailureClassification::TestFailure,
                        FailureClassification::Timeout
                    ])
                );
            }
            _ => panic!("expected Submit command"),
        }
    }

    #[test]
    fn submit_defaults_leave_overrides_unset() {
        let cli = Cli::parse_from(["runlane", "submit", "run.sh"]);
        let Command::Submit(args) = cli.command else {
            panic!("expected Submit command");
        };
        let spec = args.to_spec();
        assert_eq!(spec.framework, "shell");
        assert!(spec.allow_retry_on.is_none());
        assert!(spec.max_retries.is_none());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "runlane",
            "--url",
            "http://10.0.0.5:7878",
            "--verbose",
            "--log-json",
            "health",
        ]);
        assert!(cli.verbose);
        assert!(cli.log_json);
        assert_eq!(cli.url, "http://10.0.0.5:7878");
        assert!(matches!(cli.command, Command::Health));
    }

    #[test]
    fn cli_parses_serve_and_wait() {
        let cli = Cli::parse_from(["runlane", "serve", "--bind", "0.0.0.0:9000"]);
        assert!(matches!(cli.command, Command::Serve { bind: Some(ref b) } if b == "0.0.0.0:9000"));

        let cli = Cli::parse_from(["runlane", "wait", "abc", "--interval", "0.5"]);
        match cli.command {
            Command::Wait { job_id, interval } => {
                assert_eq!(job_id, "abc");
                assert_eq!(interval, 0.5);
            }
            _ => panic!("expected Wait command"),
        }
    }

    #[test]
    fn rejects_unknown_priority() {
        assert!(Cli::try_parse_from(["runlane", "submit", "x", "--priority", "urgent"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
