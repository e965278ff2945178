//! Task status machine and per-instance state flags

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::proxy::TaskId;

/// Standard output labels. Custom outputs declared in the config share the
/// same namespace.
pub const OUTPUT_SUBMITTED: &str = "submitted";
pub const OUTPUT_SUBMIT_FAILED: &str = "submit-failed";
pub const OUTPUT_STARTED: &str = "started";
pub const OUTPUT_SUCCEEDED: &str = "succeeded";
pub const OUTPUT_FAILED: &str = "failed";
pub const OUTPUT_EXPIRED: &str = "expired";

/// Task instance status.
///
/// ```text
///               .--------------.
///               |              v
///   waiting -> preparing -> submitted -> running -> succeeded
///      ^          |             |            |
///      |          v             v            v
///      '-- submit-failed   submit-failed   failed -> (retry -> waiting)
/// ```
///
/// `expired` is terminal, reached from `waiting` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Waiting,
    Preparing,
    Submitted,
    Running,
    Succeeded,
    Failed,
    SubmitFailed,
    Expired,
}

impl TaskStatus {
    /// Submitted or running: has a live job somewhere.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Submitted | TaskStatus::Running)
    }

    /// Has never had a job: used by late detection.
    pub fn is_never_active(&self) -> bool {
        matches!(self, TaskStatus::Waiting | TaskStatus::Expired)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::SubmitFailed | TaskStatus::Expired
        )
    }

    /// Ordering rank used to detect state reversals (a message implying an
    /// earlier rank than the current status is suspect and triggers a poll).
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Waiting => 0,
            TaskStatus::Preparing => 1,
            TaskStatus::Submitted => 2,
            TaskStatus::Running => 3,
            TaskStatus::SubmitFailed | TaskStatus::Failed | TaskStatus::Succeeded | TaskStatus::Expired => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Preparing => "preparing",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::SubmitFailed => "submit-failed",
            TaskStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "preparing" => Ok(TaskStatus::Preparing),
            "submitted" => Ok(TaskStatus::Submitted),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "submit-failed" => Ok(TaskStatus::SubmitFailed),
            "expired" => Ok(TaskStatus::Expired),
            other => Err(format!("unknown task status: '{}'", other)),
        }
    }
}

/// One upstream dependency of a task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisite {
    pub parent: TaskId,
    pub output: String,
    pub satisfied: bool,
}

/// The mutable state of a task instance: status, gating sub-flags, and
/// trigger satisfaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskState {
    pub status: Option<TaskStatus>,
    pub is_held: bool,
    pub is_queued: bool,
    pub is_runahead: bool,
    /// Dirty flag: the data store and DB need this instance re-published.
    #[serde(skip)]
    pub is_updated: bool,
    pub prerequisites: Vec<Prerequisite>,
    /// xtrigger label -> satisfied.
    pub xtriggers: BTreeMap<String, bool>,
    /// External trigger name -> satisfied.
    pub external_triggers: BTreeMap<String, bool>,
    /// Outputs this instance has completed.
    pub outputs: Vec<String>,
}

impl TaskState {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status.unwrap_or(TaskStatus::Waiting)
    }

    /// Change status. Returns true if the status actually changed, in which
    /// case the dirty flag is set.
    pub fn reset(&mut self, status: TaskStatus) -> bool {
        if self.status() == status {
            return false;
        }
        self.status = Some(status);
        self.is_updated = true;
        true
    }

    pub fn prerequisites_all_satisfied(&self) -> bool {
        self.prerequisites.iter().all(|p| p.satisfied)
    }

    pub fn xtriggers_all_satisfied(&self) -> bool {
        self.xtriggers.values().all(|v| *v)
    }

    pub fn external_triggers_all_satisfied(&self) -> bool {
        self.external_triggers.values().all(|v| *v)
    }

    /// Mark any prerequisite on `(parent, output)` satisfied. Returns true
    /// if one flipped.
    pub fn satisfy_prerequisite(&mut self, parent: &TaskId, output: &str) -> bool {
        let mut flipped = false;
        for prereq in &mut self.prerequisites {
            if !prereq.satisfied && prereq.parent == *parent && prereq.output == output {
                prereq.satisfied = true;
                flipped = true;
            }
        }
        if flipped {
            self.is_updated = true;
        }
        flipped
    }

    /// Record a completed output. Returns false if it was already recorded.
    pub fn add_output(&mut self, output: &str) -> bool {
        if self.outputs.iter().any(|o| o == output) {
            return false;
        }
        self.outputs.push(output.to_string());
        self.is_updated = true;
        true
    }

    /// Force-satisfy every gate, for manual triggering.
    pub fn satisfy_all(&mut self) {
        for prereq in &mut self.prerequisites {
            prereq.satisfied = true;
        }
        for value in self.xtriggers.values_mut() {
            *value = true;
        }
        for value in self.external_triggers.values_mut() {
            *value = true;
        }
        self.is_updated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;

    fn id(name: &str) -> TaskId {
        TaskId::new(CyclePoint::Integer(1), name)
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::SubmitFailed,
            TaskStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_status_classes() {
        assert!(TaskStatus::Running.is_active());
        assert!(!TaskStatus::Preparing.is_active());
        assert!(TaskStatus::Waiting.is_never_active());
        assert!(TaskStatus::Expired.is_terminal());
    }

    #[test]
    fn test_reset_sets_dirty_flag() {
        let mut state = TaskState::new(TaskStatus::Waiting);
        assert!(state.reset(TaskStatus::Preparing));
        assert!(state.is_updated);
        // Same status again is a no-op.
        state.is_updated = false;
        assert!(!state.reset(TaskStatus::Preparing));
        assert!(!state.is_updated);
    }

    #[test]
    fn test_satisfy_prerequisite() {
        let mut state = TaskState::new(TaskStatus::Waiting);
        state.prerequisites.push(Prerequisite {
            parent: id("foo"),
            output: OUTPUT_SUCCEEDED.to_string(),
            satisfied: false,
        });
        assert!(!state.prerequisites_all_satisfied());
        assert!(state.satisfy_prerequisite(&id("foo"), OUTPUT_SUCCEEDED));
        assert!(state.prerequisites_all_satisfied());
        // Already satisfied: no flip.
        assert!(!state.satisfy_prerequisite(&id("foo"), OUTPUT_SUCCEEDED));
    }

    #[test]
    fn test_add_output_dedups() {
        let mut state = TaskState::new(TaskStatus::Running);
        assert!(state.add_output(OUTPUT_STARTED));
        assert!(!state.add_output(OUTPUT_STARTED));
    }
}
