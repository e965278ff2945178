//! Live task instances (task proxies)
//!
//! The task pool exclusively owns these. Everything else refers to a task
//! by its identity `point/name`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cycling::CyclePoint;
use crate::error::WorkflowError;

use super::def::TaskDef;
use super::state::{Prerequisite, TaskState, TaskStatus};

/// Task instance identity: cycle point plus task name, rendered
/// `point/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub point: CyclePoint,
    pub name: String,
}

impl TaskId {
    pub fn new(point: CyclePoint, name: impl Into<String>) -> Self {
        Self {
            point,
            name: name.into(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.point, self.name)
    }
}

impl FromStr for TaskId {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (point, name) = s
            .split_once('/')
            .ok_or_else(|| WorkflowError::Input(format!("invalid task id: '{}'", s)))?;
        if name.is_empty() || name.contains('/') {
            return Err(WorkflowError::Input(format!("invalid task id: '{}'", s)));
        }
        Ok(TaskId::new(point.parse()?, name))
    }
}

/// Parse a fully qualified job id `point/name[/submit_num]`, stripping the
/// job component. Messages from simulation mode carry no submit number.
pub fn parse_job_id(s: &str) -> Result<(TaskId, Option<u32>), WorkflowError> {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.as_slice() {
        [point, name] => Ok((TaskId::new(point.parse()?, *name), None)),
        [point, name, submit] => {
            let submit_num: u32 = submit
                .parse()
                .map_err(|_| WorkflowError::Input(format!("invalid job id: '{}'", s)))?;
            Ok((TaskId::new(point.parse()?, *name), Some(submit_num)))
        }
        _ => Err(WorkflowError::Input(format!("invalid job id: '{}'", s))),
    }
}

/// Metadata of the most recent job of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_runner: String,
    pub platform: String,
    pub host: String,
    pub job_id: String,
}

/// A live task instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProxy {
    pub id: TaskId,
    /// Flows this instance belongs to. Empty only for flow-none spawns.
    pub flow_nums: BTreeSet<u32>,
    pub state: TaskState,
    /// Monotonically increasing per instance; bumped on entering the
    /// submission pipeline.
    pub submit_num: u32,
    /// Wait for flow merge before spawning children (manual trigger option).
    pub flow_wait: bool,
    pub is_late: bool,
    /// Set by force-trigger: bypasses trigger gates once.
    pub is_manual_submit: bool,
    pub job: Option<JobInfo>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock time after which a still-waiting instance expires.
    pub expire_time: Option<DateTime<Utc>>,
    /// Wall-clock time after which a never-active instance is late.
    pub late_time: Option<DateTime<Utc>>,
}

impl TaskProxy {
    /// Build an instance of `def` at `point`, gated on all of its triggers.
    pub fn new(def: &TaskDef, point: CyclePoint, flow_nums: BTreeSet<u32>) -> Self {
        let mut state = TaskState::new(TaskStatus::Waiting);
        for trigger in &def.triggers {
            let parent_point = match &trigger.offset {
                Some(offset) => point.add(offset).unwrap_or(point),
                None => point,
            };
            state.prerequisites.push(Prerequisite {
                parent: TaskId::new(parent_point, trigger.parent.clone()),
                output: trigger.output.clone(),
                satisfied: false,
            });
        }
        for xtrigger in &def.xtriggers {
            state.xtriggers.insert(xtrigger.clone(), false);
        }
        for ext in &def.ext_triggers {
            state.external_triggers.insert(ext.clone(), false);
        }
        let now = Utc::now();
        let expire_time = def
            .expire_offset_secs
            .map(|secs| point.as_time().unwrap_or(now) + chrono::Duration::seconds(secs));
        Self {
            id: TaskId::new(point, def.name.clone()),
            flow_nums,
            state,
            submit_num: 0,
            flow_wait: false,
            is_late: false,
            is_manual_submit: false,
            job: None,
            created_at: now,
            submitted_at: None,
            started_at: None,
            finished_at: None,
            expire_time,
            late_time: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    /// Invariant: ready iff waiting, all gates satisfied, and neither held
    /// nor in runahead. Manual submission bypasses the trigger gates.
    pub fn is_ready_to_run(&self) -> bool {
        if self.status() != TaskStatus::Waiting || self.state.is_held || self.state.is_runahead {
            return false;
        }
        if self.is_manual_submit {
            return true;
        }
        self.state.prerequisites_all_satisfied()
            && self.state.xtriggers_all_satisfied()
            && self.state.external_triggers_all_satisfied()
    }

    /// Whether this instance still blocks workflow completion.
    pub fn is_complete(&self) -> bool {
        self.status() == TaskStatus::Succeeded || self.status() == TaskStatus::Expired
    }

    /// Merge another flow's membership into this instance.
    pub fn merge_flows(&mut self, other: &BTreeSet<u32>) {
        let before = self.flow_nums.len();
        self.flow_nums.extend(other.iter().copied());
        if self.flow_nums.len() != before {
            self.state.is_updated = true;
        }
    }

    /// Qualified id of the current job, `point/name/submit_num`.
    pub fn job_identity(&self) -> String {
        format!("{}/{:02}", self.id, self.submit_num)
    }

    /// Elapsed run time in seconds if the task has started and finished.
    pub fn elapsed_secs(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::Sequence;

    fn def_with_trigger() -> TaskDef {
        TaskDef {
            name: "bar".into(),
            sequence: Sequence::once(CyclePoint::Integer(1)),
            triggers: vec![super::super::def::TaskTrigger {
                parent: "foo".into(),
                output: "succeeded".into(),
                offset: None,
            }],
            outputs: vec![],
            platform: "localhost".into(),
            queue: "default".into(),
            xtriggers: vec![],
            ext_triggers: vec![],
            expire_offset_secs: None,
            late_offset_secs: None,
            retry_delays_secs: vec![],
            submission_retry_delays_secs: vec![],
            execution_timeout_secs: None,
            submission_timeout_secs: None,
            simulated_run_secs: 1,
            event_handlers: vec![],
            script: String::new(),
        }
    }

    #[test]
    fn test_task_id_roundtrip() {
        let id: TaskId = "1/foo".parse().unwrap();
        assert_eq!(id, TaskId::new(CyclePoint::Integer(1), "foo"));
        assert_eq!(id.to_string(), "1/foo");
        assert!("foo".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_parse_job_id() {
        let (id, submit) = parse_job_id("1/foo/01").unwrap();
        assert_eq!(id.to_string(), "1/foo");
        assert_eq!(submit, Some(1));
        let (_, submit) = parse_job_id("1/foo").unwrap();
        assert_eq!(submit, None);
        assert!(parse_job_id("1/foo/01/extra").is_err());
    }

    #[test]
    fn test_new_proxy_gated_on_trigger() {
        let proxy = TaskProxy::new(&def_with_trigger(), CyclePoint::Integer(1), [1].into());
        assert_eq!(proxy.status(), TaskStatus::Waiting);
        assert!(!proxy.is_ready_to_run());
        assert_eq!(proxy.state.prerequisites.len(), 1);
    }

    #[test]
    fn test_ready_after_prerequisite_satisfied() {
        let mut proxy = TaskProxy::new(&def_with_trigger(), CyclePoint::Integer(1), [1].into());
        let parent = TaskId::new(CyclePoint::Integer(1), "foo");
        proxy.state.satisfy_prerequisite(&parent, "succeeded");
        assert!(proxy.is_ready_to_run());
        proxy.state.is_held = true;
        assert!(!proxy.is_ready_to_run());
    }

    #[test]
    fn test_manual_submit_bypasses_gates() {
        let mut proxy = TaskProxy::new(&def_with_trigger(), CyclePoint::Integer(1), [1].into());
        proxy.is_manual_submit = true;
        assert!(proxy.is_ready_to_run());
        // But not the hold flag.
        proxy.state.is_held = true;
        assert!(!proxy.is_ready_to_run());
    }

    #[test]
    fn test_merge_flows_sets_dirty() {
        let mut proxy = TaskProxy::new(&def_with_trigger(), CyclePoint::Integer(1), [1].into());
        proxy.state.is_updated = false;
        proxy.merge_flows(&[2].into());
        assert!(proxy.state.is_updated);
        assert_eq!(proxy.flow_nums, [1, 2].into());
    }
}
