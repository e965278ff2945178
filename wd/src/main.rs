//! workflowd entry point

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{error, info};

use workflowd::cli::{Cli, Command, default_run_dir};
use workflowd::config::{RunOptions, WorkflowConfig};
use workflowd::error::WorkflowError;
use workflowd::scheduler::Scheduler;
use workflowd::server::ContactFile;

fn setup_logging(cli_log_level: Option<&str>, log_dir: Option<&PathBuf>) -> Result<()> {
    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()));

    if let Some(log_dir) = log_dir {
        std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;
        let log_file = std::fs::File::create(log_dir.join("scheduler.log")).context("Failed to create log file")?;
        builder.with_writer(log_file).with_ansi(false).init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Play {
            workflow,
            config,
            run_dir,
            initial_cycle_point,
            start_cycle_point,
            start_tasks,
            final_cycle_point,
            stop_cycle_point,
            hold_after_cycle_point,
            pause,
            set,
            mode,
            reftest,
            profile,
            abort_if_any_task_fails,
        } => {
            let mut template_vars = Vec::with_capacity(set.len());
            for item in &set {
                let (key, value) = item
                    .split_once('=')
                    .ok_or_else(|| eyre::eyre!("--set takes KEY=VALUE, got '{}'", item))?;
                template_vars.push((key.to_string(), value.to_string()));
            }
            let run_dir = run_dir.unwrap_or_else(|| default_run_dir(&workflow));
            let config_path = config.unwrap_or_else(|| run_dir.join("flow.yaml"));
            let log_dir = run_dir.join("log").join("scheduler");
            setup_logging(cli.log_level.as_deref(), Some(&log_dir))?;

            let options = RunOptions {
                initial_cycle_point,
                start_cycle_point,
                start_tasks,
                final_cycle_point,
                stop_cycle_point,
                hold_after_cycle_point,
                paused_start: pause.then_some(true),
                run_mode: Some(mode.into()),
                template_vars,
                reftest,
                profile_mode: profile,
                abort_if_any_task_fails,
            };
            Ok(play(&workflow, &config_path, &run_dir, options).await)
        }
        Command::Validate { config } => {
            setup_logging(cli.log_level.as_deref(), None)?;
            match WorkflowConfig::load(&config) {
                Ok(parsed) => {
                    println!("Valid for {} task(s)", parsed.runtime.len());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("{}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Ping { run_dir } => {
            setup_logging(cli.log_level.as_deref(), None)?;
            match ContactFile::load(&run_dir) {
                Ok(contact) => {
                    for (key, value) in &contact.fields {
                        println!("{}={}", key, value);
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(_) => {
                    println!("Workflow is not running (no contact file)");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// Run one workflow to completion. Exit 0 only on a clean stop.
async fn play(workflow: &str, config_path: &PathBuf, run_dir: &PathBuf, options: RunOptions) -> ExitCode {
    let mut scheduler = match Scheduler::new(workflow, config_path, run_dir, options) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            // Startup-load failures are expected errors: no traceback.
            error!("Workflow shutting down - {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = scheduler.start_server() {
        error!("Workflow shutting down - {}", e);
        return ExitCode::FAILURE;
    }
    spawn_signal_handler(scheduler.command_sender());
    match scheduler.run().await {
        Ok(()) => {
            info!("DONE");
            ExitCode::SUCCESS
        }
        Err(WorkflowError::Unexpected(e)) => {
            error!(error = ?e, "An uncaught error caused the scheduler to shut down.");
            ExitCode::FAILURE
        }
        Err(_) => ExitCode::FAILURE,
    }
}

/// Translate process signals into stop commands: the first asks for a
/// prompt stop, a repeat abandons helpers too.
fn spawn_signal_handler(command_tx: tokio::sync::mpsc::UnboundedSender<workflowd::Command>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else { return };
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else { return };
        let mut mode = "now";
        loop {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            tracing::warn!("signal received, stopping ({})", mode);
            let _ = command_tx.send(workflowd::Command::Stop {
                mode: Some(mode.to_string()),
                cycle_point: None,
                clock_time: None,
                task: None,
                flow_num: None,
            });
            mode = "now-now";
        }
    });
}
