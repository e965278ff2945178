//! Workflow-level status: stop modes and auto-restart modes

use std::fmt;

use serde::{Deserialize, Serialize};

/// How the workflow should stop, ordered by urgency (low to high).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopMode {
    /// All work complete, or a stop condition was reached.
    Auto,
    /// A configured abort-on-task-failure condition triggered.
    AutoOnTaskFailure,
    /// Finish active jobs, then stop.
    RequestClean,
    /// Kill active jobs (they remain retryable on restart), then stop.
    RequestKill,
    /// Stop promptly but let local helper processes finish.
    RequestNow,
    /// Stop immediately, abandoning helper processes.
    RequestNowNow,
}

impl StopMode {
    /// Human description used in the shutdown log line.
    pub fn describe(&self) -> &'static str {
        match self {
            StopMode::Auto => "AUTOMATIC",
            StopMode::AutoOnTaskFailure => "AUTOMATIC (ON TASK FAILURE)",
            StopMode::RequestClean => "REQUEST(CLEAN)",
            StopMode::RequestKill => "REQUEST(KILL)",
            StopMode::RequestNow => "REQUEST(NOW)",
            StopMode::RequestNowNow => "REQUEST(NOW-NOW)",
        }
    }

    /// Parse an operator-supplied mode name.
    pub fn parse(name: &str) -> Option<StopMode> {
        match name.to_ascii_lowercase().as_str() {
            "auto" => Some(StopMode::Auto),
            "clean" | "request-clean" => Some(StopMode::RequestClean),
            "kill" | "request-kill" => Some(StopMode::RequestKill),
            "now" | "request-now" => Some(StopMode::RequestNow),
            "now-now" | "request-now-now" => Some(StopMode::RequestNowNow),
            _ => None,
        }
    }
}

impl fmt::Display for StopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// What to do when the run host asks the scheduler to leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoRestartMode {
    /// Stop the workflow, then restart it on another host.
    RestartNormal,
    /// Stop the workflow without restarting it.
    ForceStop,
}

/// The run mode the workflow was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Live,
    /// Jobs are submitted but replaced by a trivial script.
    Dummy,
    /// No jobs are submitted; outcomes are simulated in-process.
    Simulation,
}

impl RunMode {
    pub fn is_simulation(&self) -> bool {
        matches!(self, RunMode::Simulation)
    }

    /// Simulation and dummy modes suppress workflow event handlers.
    pub fn suppresses_event_handlers(&self) -> bool {
        matches!(self, RunMode::Simulation | RunMode::Dummy)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Live => write!(f, "live"),
            RunMode::Dummy => write!(f, "dummy"),
            RunMode::Simulation => write!(f, "simulation"),
        }
    }
}
