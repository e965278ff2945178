//! Workflow configuration types and loading
//!
//! The workflow is described by a declarative YAML file: scheduling limits,
//! per-task runtime settings and triggers, platforms, and event handling.
//! Full graph-DSL compilation is out of scope; the triggers here are already
//! in edge form.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cycling::{CyclePoint, Interval, Sequence};
use crate::error::WorkflowError;
use crate::platform::Platform;
use crate::status::RunMode;
use crate::task::{TaskDef, TaskTrigger};
use crate::task::def::TaskEventHandler;
use crate::timer::WorkflowEvent;
use crate::xtrigger::XtriggerDef;

/// Top-level workflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    pub scheduler: SchedulerSection,
    pub scheduling: SchedulingSection,
    /// Per-task runtime settings, keyed by task name.
    pub runtime: HashMap<String, TaskSection>,
    /// Named execution platforms. "localhost" is always available.
    pub platforms: HashMap<String, Platform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct SchedulerSection {
    pub utc_mode: bool,
    pub cycle_point_time_zone: Option<String>,
    pub events: EventsSection,
    /// External command used to restart the workflow on another host.
    pub auto_restart_command: Option<String>,
    /// Host selection command for auto-restart (prints one hostname).
    pub host_select_command: Option<String>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            utc_mode: true,
            cycle_point_time_zone: None,
            events: EventsSection::default(),
            auto_restart_command: None,
            host_select_command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct EventsSection {
    pub workflow_timeout_secs: Option<i64>,
    pub abort_on_workflow_timeout: bool,
    pub workflow_timeout_handlers: Vec<String>,
    pub inactivity_timeout_secs: Option<i64>,
    pub abort_on_inactivity_timeout: bool,
    pub inactivity_timeout_handlers: Vec<String>,
    pub stall_timeout_secs: Option<i64>,
    pub abort_on_stall_timeout: bool,
    pub stall_timeout_handlers: Vec<String>,
    pub stall_handlers: Vec<String>,
    pub startup_handlers: Vec<String>,
    pub shutdown_handlers: Vec<String>,
    pub aborted_handlers: Vec<String>,
    /// Abort the whole workflow as soon as any task fails.
    pub abort_if_any_task_fails: bool,
}

impl EventsSection {
    /// Timer interval configured for a timeout event, if any.
    pub fn timeout_for(&self, event: WorkflowEvent) -> Option<i64> {
        match event {
            WorkflowEvent::WorkflowTimeout => self.workflow_timeout_secs,
            WorkflowEvent::InactivityTimeout => self.inactivity_timeout_secs,
            WorkflowEvent::StallTimeout => self.stall_timeout_secs,
            _ => None,
        }
    }

    /// Whether the event aborts the workflow on firing.
    pub fn abort_on(&self, event: WorkflowEvent) -> bool {
        match event {
            WorkflowEvent::WorkflowTimeout => self.abort_on_workflow_timeout,
            WorkflowEvent::InactivityTimeout => self.abort_on_inactivity_timeout,
            WorkflowEvent::StallTimeout => self.abort_on_stall_timeout,
            _ => false,
        }
    }

    /// Handler commands configured for the event.
    pub fn handlers_for(&self, event: WorkflowEvent) -> &[String] {
        match event {
            WorkflowEvent::WorkflowTimeout => &self.workflow_timeout_handlers,
            WorkflowEvent::InactivityTimeout => &self.inactivity_timeout_handlers,
            WorkflowEvent::StallTimeout => &self.stall_timeout_handlers,
            WorkflowEvent::Stall => &self.stall_handlers,
            WorkflowEvent::Startup => &self.startup_handlers,
            WorkflowEvent::Shutdown => &self.shutdown_handlers,
            WorkflowEvent::Aborted => &self.aborted_handlers,
            WorkflowEvent::Late => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct SchedulingSection {
    pub initial_cycle_point: Option<CyclePoint>,
    pub final_cycle_point: Option<CyclePoint>,
    pub stop_after_cycle_point: Option<CyclePoint>,
    pub hold_after_cycle_point: Option<CyclePoint>,
    /// Default interval for cycling tasks with no explicit cycling block.
    pub default_interval: Option<Interval>,
    /// Runahead window: how many sequence intervals beyond the anchor point
    /// instances may run.
    pub runahead_limit: u32,
    /// Internal queues with concurrency caps.
    pub queues: HashMap<String, QueueSection>,
    /// xtrigger definitions, looked up by the labels tasks declare.
    pub xtriggers: HashMap<String, XtriggerDef>,
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            initial_cycle_point: None,
            final_cycle_point: None,
            stop_after_cycle_point: None,
            hold_after_cycle_point: None,
            default_interval: None,
            runahead_limit: 5,
            queues: HashMap::new(),
            xtriggers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSection {
    /// Maximum number of active (preparing/submitted/running) members.
    pub limit: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { limit: 0 }
    }
}

/// Explicit cycling for one task, overriding the workflow defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CyclingSection {
    pub start: Option<CyclePoint>,
    pub stop: Option<CyclePoint>,
    pub interval: Option<Interval>,
}

/// Per-task configuration under `runtime`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct TaskSection {
    pub cycling: Option<CyclingSection>,
    pub triggers: Vec<TaskTrigger>,
    pub outputs: Vec<String>,
    pub platform: Option<String>,
    pub queue: Option<String>,
    pub xtriggers: Vec<String>,
    pub ext_triggers: Vec<String>,
    pub expire_offset_secs: Option<i64>,
    pub late_offset_secs: Option<i64>,
    pub retry_delays_secs: Vec<i64>,
    pub submission_retry_delays_secs: Vec<i64>,
    pub execution_timeout_secs: Option<i64>,
    pub submission_timeout_secs: Option<i64>,
    pub simulated_run_secs: Option<i64>,
    pub event_handlers: Vec<TaskEventHandler>,
    pub script: Option<String>,
}

impl WorkflowConfig {
    /// Load and validate a workflow configuration file.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let content = fs::read_to_string(path)
            .map_err(|e| WorkflowError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::load_str(&content)?;
        info!(path = %path.display(), tasks = config.runtime.len(), "loaded workflow configuration");
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn load_str(content: &str) -> Result<Self, WorkflowError> {
        let config: WorkflowConfig =
            serde_yaml::from_str(content).map_err(|e| WorkflowError::Config(format!("illegal item: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        for (name, task) in &self.runtime {
            for trigger in &task.triggers {
                if !self.runtime.contains_key(&trigger.parent) {
                    return Err(WorkflowError::Config(format!(
                        "task '{}' triggers off undefined task '{}'",
                        name, trigger.parent
                    )));
                }
            }
            if let Some(platform) = &task.platform {
                if platform != "localhost" && !self.platforms.contains_key(platform) {
                    return Err(WorkflowError::Config(format!(
                        "task '{}' uses undefined platform '{}'",
                        name, platform
                    )));
                }
            }
        }
        if self.runtime.is_empty() {
            return Err(WorkflowError::Config("no tasks defined under 'runtime'".into()));
        }
        Ok(())
    }

    /// The initial cycle point, which every run must have (from config or
    /// the command line).
    pub fn initial_point(&self) -> Result<CyclePoint, WorkflowError> {
        self.scheduling
            .initial_cycle_point
            .ok_or_else(|| WorkflowError::Config("no initial cycle point".into()))
    }

    /// Expand the runtime section into task definitions.
    pub fn task_defs(&self) -> Result<HashMap<String, TaskDef>, WorkflowError> {
        let initial = self.initial_point()?;
        let mut defs = HashMap::with_capacity(self.runtime.len());
        for (name, task) in &self.runtime {
            let cycling = task.cycling.clone().unwrap_or_default();
            let start = cycling.start.unwrap_or(initial);
            let stop = cycling.stop.or(self.scheduling.final_cycle_point);
            let interval = cycling.interval.or(self.scheduling.default_interval);
            let sequence = match interval {
                Some(interval) => Sequence {
                    start,
                    stop,
                    interval: Some(interval),
                },
                // No interval anywhere: run once at the start point.
                None => Sequence::once(start),
            };
            defs.insert(
                name.clone(),
                TaskDef {
                    name: name.clone(),
                    sequence,
                    triggers: task.triggers.clone(),
                    outputs: task.outputs.clone(),
                    platform: task.platform.clone().unwrap_or_else(|| "localhost".to_string()),
                    queue: task.queue.clone().unwrap_or_else(|| "default".to_string()),
                    xtriggers: task.xtriggers.clone(),
                    ext_triggers: task.ext_triggers.clone(),
                    expire_offset_secs: task.expire_offset_secs,
                    late_offset_secs: task.late_offset_secs,
                    retry_delays_secs: task.retry_delays_secs.clone(),
                    submission_retry_delays_secs: task.submission_retry_delays_secs.clone(),
                    execution_timeout_secs: task.execution_timeout_secs,
                    submission_timeout_secs: task.submission_timeout_secs,
                    simulated_run_secs: task.simulated_run_secs.unwrap_or(1),
                    event_handlers: task.event_handlers.clone(),
                    script: task.script.clone().unwrap_or_default(),
                },
            );
        }
        Ok(defs)
    }

    /// Look up a platform record; "localhost" falls back to the built-in.
    pub fn platform(&self, name: &str) -> Option<Platform> {
        self.platforms.get(name).cloned().or_else(|| {
            (name == "localhost").then(Platform::localhost)
        })
    }

    /// Per-queue concurrency limit; 0 means unlimited.
    pub fn queue_limit(&self, queue: &str) -> usize {
        self.scheduling.queues.get(queue).map(|q| q.limit).unwrap_or(0)
    }
}

/// Options resolved from the command line for one scheduler run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub initial_cycle_point: Option<String>,
    pub start_cycle_point: Option<String>,
    pub start_tasks: Vec<String>,
    pub final_cycle_point: Option<String>,
    pub stop_cycle_point: Option<String>,
    pub hold_after_cycle_point: Option<String>,
    pub paused_start: Option<bool>,
    pub run_mode: Option<RunMode>,
    /// Template variables (`key=value`); override any stored in the DB.
    pub template_vars: Vec<(String, String)>,
    pub reftest: bool,
    pub profile_mode: bool,
    pub abort_if_any_task_fails: bool,
}
