//! Scheduler error taxonomy
//!
//! Every failure the main loop can see maps onto one of these kinds; the
//! kind decides how the shutdown path logs it and what the process exit
//! status is. `SchedulerStop` is the one non-error: the sentinel for a
//! deliberate, clean shutdown.

use thiserror::Error;

use crate::status::StopMode;

/// Cycle-point and duration parse/arithmetic failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CyclingError {
    #[error("invalid cycle point: '{0}'")]
    BadPoint(String),

    #[error("invalid ISO-8601 duration: '{0}'")]
    BadDuration(String),

    #[error("interval {interval} cannot be applied to point {point}")]
    IntervalKind { point: String, interval: String },
}

/// Top-level error kind seen by the run loop and the shutdown path.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Invalid configuration. Logged without a traceback when raised during
    /// startup load; with one otherwise.
    #[error("{0}")]
    Config(String),

    /// A queued command failed. Non-fatal: logged against the command only.
    #[error("{0}")]
    CommandFailed(String),

    #[error(transparent)]
    Cycling(#[from] CyclingError),

    /// Invalid operator input (bad CLI option, bad argument).
    #[error("{0}")]
    Input(String),

    /// Deliberate shutdown with the given stop mode. Not an error.
    #[error("{0}")]
    Stop(StopMode),

    /// Expected error shutdown (e.g. abort-on-timeout), logged as ERROR.
    #[error("{0}")]
    Scheduler(String),

    /// No suitable host could be selected during auto-restart.
    #[error("host selection failed: {0}")]
    HostSelect(String),

    /// Anything else: logged with full detail and a critical banner.
    #[error("{0}")]
    Unexpected(eyre::Report),
}

impl From<eyre::Report> for WorkflowError {
    fn from(report: eyre::Report) -> Self {
        WorkflowError::Unexpected(report)
    }
}

impl WorkflowError {
    /// Whether the process should exit 0 for this shutdown reason.
    pub fn is_clean_stop(&self) -> bool {
        matches!(self, WorkflowError::Stop(_))
    }

    /// Whether this kind is an "expected" failure that is logged without a
    /// traceback banner.
    pub fn is_expected(&self) -> bool {
        !matches!(self, WorkflowError::Unexpected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_clean() {
        assert!(WorkflowError::Stop(StopMode::Auto).is_clean_stop());
        assert!(!WorkflowError::Scheduler("abort".into()).is_clean_stop());
    }

    #[test]
    fn test_unexpected_is_not_expected() {
        let err = WorkflowError::Unexpected(eyre::eyre!("boom"));
        assert!(!err.is_expected());
        assert!(WorkflowError::CommandFailed("x".into()).is_expected());
    }
}
