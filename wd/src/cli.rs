//! Command-line interface definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::status::RunMode;

#[derive(Debug, Parser)]
#[command(name = "wd", about = "Cyclic workflow scheduler daemon", version)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start (or restart) a workflow scheduler
    Play {
        /// Workflow id
        workflow: String,

        /// Workflow configuration file (default: <run-dir>/flow.yaml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Run directory (default: ~/wd-run/<workflow>)
        #[arg(long)]
        run_dir: Option<PathBuf>,

        /// Initial cycle point (new runs only)
        #[arg(long = "icp")]
        initial_cycle_point: Option<String>,

        /// Start cycle point for a warm start (new runs only)
        #[arg(long = "startcp")]
        start_cycle_point: Option<String>,

        /// Start from these tasks (`point/name`; new runs only)
        #[arg(long = "starttask")]
        start_tasks: Vec<String>,

        /// Final cycle point
        #[arg(long = "fcp")]
        final_cycle_point: Option<String>,

        /// Stop after this cycle point
        #[arg(long = "stopcp")]
        stop_cycle_point: Option<String>,

        /// Hold all tasks after this cycle point
        #[arg(long = "holdcp")]
        hold_after_cycle_point: Option<String>,

        /// Start in the paused state
        #[arg(long)]
        pause: bool,

        /// Template variables, `KEY=VALUE` (repeatable)
        #[arg(long = "set")]
        set: Vec<String>,

        /// Run mode
        #[arg(long, value_enum, default_value_t = RunModeArg::Live)]
        mode: RunModeArg,

        /// Reference test mode: log triggering at INFO level
        #[arg(long)]
        reftest: bool,

        /// Log main-loop timing for profiling
        #[arg(long)]
        profile: bool,

        /// Abort the workflow if any task fails
        #[arg(long)]
        abort_if_any_task_fails: bool,
    },

    /// Validate a workflow configuration without running it
    Validate {
        /// Workflow configuration file
        config: PathBuf,
    },

    /// Check whether a workflow is running (via its contact file)
    Ping {
        /// Run directory of the workflow
        run_dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunModeArg {
    Live,
    Dummy,
    Simulation,
}

impl From<RunModeArg> for RunMode {
    fn from(arg: RunModeArg) -> Self {
        match arg {
            RunModeArg::Live => RunMode::Live,
            RunModeArg::Dummy => RunMode::Dummy,
            RunModeArg::Simulation => RunMode::Simulation,
        }
    }
}

/// Default run directory for a workflow id.
pub fn default_run_dir(workflow: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wd-run")
        .join(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_parses_startup_flags() {
        let cli = Cli::parse_from([
            "wd", "play", "my/flow", "--icp", "1", "--stopcp", "5", "--pause", "--mode", "simulation",
        ]);
        match cli.command {
            Command::Play {
                workflow,
                initial_cycle_point,
                stop_cycle_point,
                pause,
                mode,
                ..
            } => {
                assert_eq!(workflow, "my/flow");
                assert_eq!(initial_cycle_point.as_deref(), Some("1"));
                assert_eq!(stop_cycle_point.as_deref(), Some("5"));
                assert!(pause);
                assert_eq!(mode, RunModeArg::Simulation);
            }
            other => panic!("expected play, got {:?}", other),
        }
    }

    #[test]
    fn test_default_run_dir_contains_workflow() {
        let dir = default_run_dir("a/b");
        assert!(dir.ends_with("wd-run/a/b"));
    }
}
