//! Static task definitions
//!
//! A `TaskDef` is everything the scheduler knows about a task before any
//! instance of it exists: where it cycles, what it depends on, what it
//! emits, and how its jobs behave.

use serde::{Deserialize, Serialize};

use crate::cycling::{Interval, Sequence};

/// One upstream dependency in the graph: "this task triggers off
/// `parent:output`", optionally at a cycle offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTrigger {
    pub parent: String,
    /// Output of the parent that satisfies this trigger.
    pub output: String,
    /// Offset added to the child's point to find the parent's point
    /// (negative intervals reach back to earlier cycles).
    #[serde(default)]
    pub offset: Option<Interval>,
}

/// Static definition of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    pub sequence: Sequence,
    #[serde(default)]
    pub triggers: Vec<TaskTrigger>,
    /// Custom outputs beyond the standard lifecycle ones.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Platform selector (platform name in the platforms table).
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Internal queue this task is limited by.
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub xtriggers: Vec<String>,
    #[serde(default)]
    pub ext_triggers: Vec<String>,
    /// Expire the instance if still waiting this long after its point.
    #[serde(default)]
    pub expire_offset_secs: Option<i64>,
    /// Emit a late event if never active this long after expected start.
    #[serde(default)]
    pub late_offset_secs: Option<i64>,
    /// Execution retry delays, in seconds, indexed by try number.
    #[serde(default)]
    pub retry_delays_secs: Vec<i64>,
    /// Submission retry delays, in seconds.
    #[serde(default)]
    pub submission_retry_delays_secs: Vec<i64>,
    #[serde(default)]
    pub execution_timeout_secs: Option<i64>,
    #[serde(default)]
    pub submission_timeout_secs: Option<i64>,
    /// Simulated run length used in simulation mode.
    #[serde(default = "default_sim_secs")]
    pub simulated_run_secs: i64,
    /// Event handler commands, keyed by task event name
    /// (e.g. "failed", "late").
    #[serde(default)]
    pub event_handlers: Vec<TaskEventHandler>,
    /// The actual job script, run by the platform's job runner.
    #[serde(default)]
    pub script: String,
}

fn default_platform() -> String {
    "localhost".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_sim_secs() -> i64 {
    1
}

/// A handler command bound to a task event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEventHandler {
    pub event: String,
    pub command: String,
}

impl TaskDef {
    /// Retry delay for the given (1-based) try number, if configured.
    pub fn retry_delay(&self, try_num: u32) -> Option<i64> {
        self.retry_delays_secs.get(try_num.saturating_sub(1) as usize).copied()
    }

    pub fn submission_retry_delay(&self, try_num: u32) -> Option<i64> {
        self.submission_retry_delays_secs
            .get(try_num.saturating_sub(1) as usize)
            .copied()
    }

    /// Handler commands configured for the given event.
    pub fn handlers_for<'a>(&'a self, event: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.event_handlers
            .iter()
            .filter(move |h| h.event == event)
            .map(|h| h.command.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;

    fn def() -> TaskDef {
        TaskDef {
            name: "foo".into(),
            sequence: Sequence::once(CyclePoint::Integer(1)),
            triggers: vec![],
            outputs: vec![],
            platform: default_platform(),
            queue: default_queue(),
            xtriggers: vec![],
            ext_triggers: vec![],
            expire_offset_secs: None,
            late_offset_secs: None,
            retry_delays_secs: vec![30, 60],
            submission_retry_delays_secs: vec![],
            execution_timeout_secs: None,
            submission_timeout_secs: None,
            simulated_run_secs: 1,
            event_handlers: vec![TaskEventHandler {
                event: "failed".into(),
                command: "notify-failure %(id)s".into(),
            }],
            script: String::new(),
        }
    }

    #[test]
    fn test_retry_delay_indexing() {
        let d = def();
        assert_eq!(d.retry_delay(1), Some(30));
        assert_eq!(d.retry_delay(2), Some(60));
        assert_eq!(d.retry_delay(3), None);
        assert_eq!(d.submission_retry_delay(1), None);
    }

    #[test]
    fn test_handlers_for_event() {
        let d = def();
        let handlers: Vec<_> = d.handlers_for("failed").collect();
        assert_eq!(handlers, vec!["notify-failure %(id)s"]);
        assert_eq!(d.handlers_for("late").count(), 0);
    }
}
