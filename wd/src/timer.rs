//! Named workflow timers
//!
//! The scheduler keeps one timer per timeout-style workflow event
//! (inactivity, workflow timeout, stall timeout). A timer is armed with
//! `reset`, disarmed with `stop`, and fires at most once per arming via
//! `timed_out`.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

/// Workflow events that timers and event handlers are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowEvent {
    Startup,
    Shutdown,
    Aborted,
    Stall,
    WorkflowTimeout,
    StallTimeout,
    InactivityTimeout,
    Late,
}

impl WorkflowEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEvent::Startup => "startup",
            WorkflowEvent::Shutdown => "shutdown",
            WorkflowEvent::Aborted => "aborted",
            WorkflowEvent::Stall => "stall",
            WorkflowEvent::WorkflowTimeout => "workflow timeout",
            WorkflowEvent::StallTimeout => "stall timeout",
            WorkflowEvent::InactivityTimeout => "inactivity timeout",
            WorkflowEvent::Late => "late",
        }
    }
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named deadline timer.
#[derive(Debug)]
pub struct Timer {
    event: WorkflowEvent,
    interval: Duration,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new(event: WorkflowEvent, interval: Duration) -> Self {
        Self {
            event,
            interval,
            deadline: None,
        }
    }

    /// Arm (or re-arm) the timer: it will fire `interval` from now.
    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
        debug!(event = %self.event, interval = ?self.interval, "timer reset");
    }

    /// Disarm the timer.
    pub fn stop(&mut self) {
        if self.deadline.take().is_some() {
            debug!(event = %self.event, "timer stopped");
        }
    }

    /// True once per arming, when the deadline has passed. The timer
    /// disarms itself on firing.
    pub fn timed_out(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                debug!(event = %self.event, "timer timed out");
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn event(&self) -> WorkflowEvent {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_once() {
        let mut timer = Timer::new(WorkflowEvent::InactivityTimeout, Duration::from_millis(0));
        timer.reset();
        assert!(timer.timed_out());
        // Disarmed after firing.
        assert!(!timer.timed_out());
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_timer_not_armed_never_fires() {
        let mut timer = Timer::new(WorkflowEvent::StallTimeout, Duration::from_millis(0));
        assert!(!timer.timed_out());
    }

    #[test]
    fn test_timer_stop_disarms() {
        let mut timer = Timer::new(WorkflowEvent::WorkflowTimeout, Duration::from_millis(0));
        timer.reset();
        timer.stop();
        assert!(!timer.timed_out());
    }

    #[test]
    fn test_timer_reset_rearms() {
        let mut timer = Timer::new(WorkflowEvent::InactivityTimeout, Duration::from_secs(3600));
        timer.reset();
        assert!(!timer.timed_out());
        assert!(timer.is_armed());
    }
}
