use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use runlane::cli::{Cli, Command};
use runlane::client::RunlaneClient;
use runlane::config::RunlaneConfig;
use runlane::server::types::JobResult;
use runlane::state_machine::FinalOutcome;
use runlane::ui;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let command = match cli.command {
        Command::Serve { bind } => {
            let mut config = RunlaneConfig::load_from(cli.config.as_deref())
                .context("failed to load configuration")?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            runlane::server::serve(config)
                .await
                .context("server failed")?;
            return Ok(ExitCode::SUCCESS);
        }
        command => command,
    };

    let client = RunlaneClient::new(cli.url.as_str()).context("failed to build HTTP client")?;
    let server = client.base_url().to_string();

    match command {
        Command::Serve { .. } => {}
        Command::Submit(args) => {
            let receipt = client
                .submit(&args.to_spec())
                .await
                .with_context(|| format!("submit to {server} failed"))?;
            if !args.wait {
                ui::print_json(&receipt);
                return Ok(ExitCode::SUCCESS);
            }
            eprintln!(
                "queued {} at position {} (~{}s)",
                receipt.job_id, receipt.queue_position, receipt.estimated_wait_seconds
            );
            let result = wait_for(&client, &receipt.job_id, Duration::from_secs(1)).await?;
            ui::print_result(&result);
            return Ok(exit_code(&result));
        }
        Command::Status { job_id } => {
            let status = client
                .status(&job_id)
                .await
                .with_context(|| format!("status of {job_id} failed"))?;
            ui::print_json(&status);
        }
        Command::Result { job_id, json } => {
            let result = client
                .result(&job_id)
                .await
                .with_context(|| format!("result of {job_id} failed"))?;
            if json {
                ui::print_json(&result);
            } else {
                ui::print_result(&result);
            }
            return Ok(exit_code(&result));
        }
        Command::Cancel { job_id } => {
            let receipt = client
                .cancel(&job_id)
                .await
                .with_context(|| format!("cancel of {job_id} failed"))?;
            ui::print_json(&receipt);
        }
        Command::Queue => {
            let snapshot = client
                .queue()
                .await
                .with_context(|| format!("queue listing from {server} failed"))?;
            ui::print_json(&snapshot);
        }
        Command::Health => {
            let health = client
                .health()
                .await
                .with_context(|| format!("health check against {server} failed"))?;
            ui::print_json(&health);
        }
        Command::Wait { job_id, interval } => {
            let interval = Duration::from_secs_f64(interval.max(0.1).min(3600.0));
            let result = wait_for(&client, &job_id, interval).await?;
            ui::print_result(&result);
            return Ok(exit_code(&result));
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Poll status until the job is terminal, then fetch its result.
async fn wait_for(client: &RunlaneClient, job_id: &str, interval: Duration) -> Result<JobResult> {
    let mut progress = ui::JobProgress::start(job_id);
    let outcome = async {
        loop {
            let status = client
                .status(job_id)
                .await
                .with_context(|| format!("status of {job_id} failed"))?;
            progress.update(&status);
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(interval).await;
        }
        client
            .result(job_id)
            .await
            .with_context(|| format!("result of {job_id} failed"))
    }
    .await;
    progress.finish();
    outcome
}

fn exit_code(result: &JobResult) -> ExitCode {
    match result.outcome {
        Some(FinalOutcome::Succeeded) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
