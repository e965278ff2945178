//! Task events: message-driven state transitions, retries, lateness,
//! and handler dispatch
//!
//! Incoming task messages are translated into status transitions here.
//! Anything that looks like a state reversal is flagged so the caller can
//! confirm by polling. Retries re-enter `waiting` behind a timer; task
//! event handlers run as helpers through the subprocess pool.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::pool::TaskPool;
use crate::procpool::{ProcJob, ProcJobKind, SubProcPool};
use crate::queues::Severity;
use crate::task::{
    OUTPUT_FAILED, OUTPUT_STARTED, OUTPUT_SUBMIT_FAILED, OUTPUT_SUBMITTED, OUTPUT_SUCCEEDED,
    TaskId, TaskStatus,
};

/// Bounded history of elapsed run times per task definition.
const MAX_ELAPSED_TIMES: usize = 10;

/// What a pending retry will do when its timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryKind {
    Execution,
    Submission,
}

/// A scheduled retry for one task instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTimer {
    pub due: DateTime<Utc>,
    pub kind: RetryKind,
}

/// A task event awaiting handler dispatch (main-loop step 14).
#[derive(Debug, Clone)]
struct PendingEvent {
    id: TaskId,
    event: String,
    message: String,
}

pub struct TaskEventsManager {
    /// Past run times per task name, newest last.
    run_times: HashMap<String, VecDeque<i64>>,
    retry_timers: BTreeMap<TaskId, RetryTimer>,
    pending_events: Vec<PendingEvent>,
    /// Simulation/dummy runs suppress handler dispatch.
    suppress_handlers: bool,
}

impl TaskEventsManager {
    pub fn new(suppress_handlers: bool) -> Self {
        Self {
            run_times: HashMap::new(),
            retry_timers: BTreeMap::new(),
            pending_events: Vec::new(),
            suppress_handlers,
        }
    }

    // === Run-time history ===

    /// Record a completed run time for the task's definition.
    pub fn record_run_time(&mut self, name: &str, secs: i64) {
        let times = self.run_times.entry(name.to_string()).or_default();
        times.push_back(secs);
        while times.len() > MAX_ELAPSED_TIMES {
            times.pop_front();
        }
    }

    /// Restore run times from the DB on restart.
    pub fn load_run_times(&mut self, name: &str, times: &[i64]) {
        for &secs in times.iter().rev().take(MAX_ELAPSED_TIMES).rev() {
            self.record_run_time(name, secs);
        }
    }

    pub fn mean_elapsed(&self, name: &str) -> Option<i64> {
        let times = self.run_times.get(name)?;
        if times.is_empty() {
            return None;
        }
        Some(times.iter().sum::<i64>() / times.len() as i64)
    }

    pub fn run_time_rows(&self) -> impl Iterator<Item = (&str, &VecDeque<i64>)> {
        self.run_times.iter().map(|(name, times)| (name.as_str(), times))
    }

    // === Message processing ===

    /// Apply one task message. Returns true if the message may represent a
    /// reversal of task state, in which case the caller should poll to
    /// confirm.
    pub fn process_message(
        &mut self,
        pool: &mut TaskPool,
        id: &TaskId,
        submit_num: Option<u32>,
        severity: Severity,
        message: &str,
        event_time: DateTime<Utc>,
    ) -> bool {
        let Some(itask) = pool.get(id) else {
            debug!(%id, %message, "message for task not in pool");
            return false;
        };
        match severity {
            Severity::Critical => error!(id = %id, %message, "task message"),
            Severity::Warning => warn!(id = %id, %message, "task message"),
            _ => info!(id = %id, %message, "task message"),
        }

        // A message from a superseded submit is stale: confirm by polling.
        if let Some(num) = submit_num {
            if num < itask.submit_num {
                debug!(id = %id, msg_submit = num, current = itask.submit_num, "stale job message");
                return true;
            }
        }

        // A message implying an earlier state than the current one is not
        // applied; polling confirms what the job is really doing.
        let current = itask.status();
        let implied = implied_status(message);
        if implied.is_some_and(|s| s.rank() < current.rank()) {
            debug!(id = %id, %message, status = %current, "message implies state reversal");
            return true;
        }

        match message {
            OUTPUT_SUBMITTED => self.task_submitted(pool, id, event_time),
            OUTPUT_STARTED => self.task_started(pool, id, event_time),
            OUTPUT_SUCCEEDED => self.task_succeeded(pool, id, event_time),
            OUTPUT_FAILED => self.task_failed(pool, id, event_time),
            OUTPUT_SUBMIT_FAILED => self.task_submit_failed(pool, id),
            custom => self.task_custom_output(pool, id, custom),
        }
        false
    }

    fn task_submitted(&mut self, pool: &mut TaskPool, id: &TaskId, event_time: DateTime<Utc>) {
        if let Some(itask) = pool.get_mut(id) {
            if itask.state.reset(TaskStatus::Submitted) {
                itask.submitted_at = Some(event_time);
                itask.state.add_output(OUTPUT_SUBMITTED);
            }
        }
        pool.spawn_on_output(id, OUTPUT_SUBMITTED);
    }

    fn task_started(&mut self, pool: &mut TaskPool, id: &TaskId, event_time: DateTime<Utc>) {
        if let Some(itask) = pool.get_mut(id) {
            if itask.state.reset(TaskStatus::Running) {
                itask.started_at = Some(event_time);
                itask.state.add_output(OUTPUT_STARTED);
            }
        }
        pool.spawn_on_output(id, OUTPUT_STARTED);
    }

    fn task_succeeded(&mut self, pool: &mut TaskPool, id: &TaskId, event_time: DateTime<Utc>) {
        if let Some(itask) = pool.get_mut(id) {
            if itask.state.reset(TaskStatus::Succeeded) {
                itask.finished_at = Some(event_time);
                itask.state.add_output(OUTPUT_SUCCEEDED);
                if let Some(secs) = itask.elapsed_secs() {
                    self.record_run_time(&id.name, secs);
                }
            }
        }
        self.retry_timers.remove(id);
        pool.spawn_on_output(id, OUTPUT_SUCCEEDED);
        pool.remove_if_complete(id);
    }

    fn task_failed(&mut self, pool: &mut TaskPool, id: &TaskId, event_time: DateTime<Utc>) {
        let retry_delay = pool
            .get(id)
            .and_then(|t| pool.def(&id.name).and_then(|d| d.retry_delay(t.submit_num)));
        let Some(itask) = pool.get_mut(id) else { return };
        itask.finished_at = Some(event_time);
        match retry_delay {
            Some(delay_secs) => {
                // Retry: back to waiting behind a timer.
                itask.state.reset(TaskStatus::Waiting);
                let due = Utc::now() + chrono::Duration::seconds(delay_secs);
                info!(id = %id, delay_secs, "failed, retrying");
                self.retry_timers.insert(
                    id.clone(),
                    RetryTimer {
                        due,
                        kind: RetryKind::Execution,
                    },
                );
            }
            None => {
                if itask.state.reset(TaskStatus::Failed) {
                    itask.state.add_output(OUTPUT_FAILED);
                    self.pending_events.push(PendingEvent {
                        id: id.clone(),
                        event: OUTPUT_FAILED.to_string(),
                        message: "job failed".to_string(),
                    });
                }
                pool.spawn_on_output(id, OUTPUT_FAILED);
            }
        }
    }

    fn task_submit_failed(&mut self, pool: &mut TaskPool, id: &TaskId) {
        let retry_delay = pool
            .get(id)
            .and_then(|t| pool.def(&id.name).and_then(|d| d.submission_retry_delay(t.submit_num)));
        let Some(itask) = pool.get_mut(id) else { return };
        match retry_delay {
            Some(delay_secs) => {
                itask.state.reset(TaskStatus::Waiting);
                let due = Utc::now() + chrono::Duration::seconds(delay_secs);
                info!(id = %id, delay_secs, "submit failed, retrying");
                self.retry_timers.insert(
                    id.clone(),
                    RetryTimer {
                        due,
                        kind: RetryKind::Submission,
                    },
                );
            }
            None => {
                if itask.state.reset(TaskStatus::SubmitFailed) {
                    itask.state.add_output(OUTPUT_SUBMIT_FAILED);
                    self.pending_events.push(PendingEvent {
                        id: id.clone(),
                        event: OUTPUT_SUBMIT_FAILED.to_string(),
                        message: "job submission failed".to_string(),
                    });
                }
                pool.spawn_on_output(id, OUTPUT_SUBMIT_FAILED);
            }
        }
    }

    fn task_custom_output(&mut self, pool: &mut TaskPool, id: &TaskId, output: &str) {
        let declared = pool
            .def(&id.name)
            .is_some_and(|d| d.outputs.iter().any(|o| o == output));
        if !declared {
            debug!(id = %id, %output, "message is not a declared output");
            return;
        }
        let added = pool
            .get_mut(id)
            .is_some_and(|itask| itask.state.add_output(output));
        if added {
            pool.spawn_on_output(id, output);
        }
    }

    /// Queue a task event for handler dispatch on the next event pass.
    pub fn queue_event(&mut self, id: &TaskId, event: &str, message: &str) {
        self.pending_events.push(PendingEvent {
            id: id.clone(),
            event: event.to_string(),
            message: message.to_string(),
        });
    }

    // === Step 14: accumulated events and retry timers ===

    /// Fire due retry timers and dispatch pending event handlers.
    /// Returns true if anything happened.
    pub fn process_events(&mut self, pool: &mut TaskPool, proc_pool: &mut SubProcPool, now: DateTime<Utc>) -> bool {
        let mut progressed = false;

        let due: Vec<TaskId> = self
            .retry_timers
            .iter()
            .filter(|(_, timer)| now >= timer.due)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            self.retry_timers.remove(&id);
            if let Some(itask) = pool.get_mut(&id) {
                if itask.status() == TaskStatus::Waiting {
                    info!(id = %id, "retry delay elapsed, queueing");
                    itask.state.satisfy_all();
                    pool.queue_task(&id);
                    progressed = true;
                }
            }
        }

        for event in std::mem::take(&mut self.pending_events) {
            progressed = true;
            self.dispatch_handlers(pool, &event.id, &event.event, &event.message, proc_pool);
        }
        progressed
    }

    fn dispatch_handlers(
        &self,
        pool: &TaskPool,
        id: &TaskId,
        event: &str,
        message: &str,
        proc_pool: &mut SubProcPool,
    ) {
        if self.suppress_handlers {
            return;
        }
        let Some(def) = pool.def(&id.name) else { return };
        for command in def.handlers_for(event) {
            let command = command
                .replace("{event}", event)
                .replace("{id}", &id.to_string())
                .replace("{message}", message);
            debug!(id = %id, event, %command, "dispatching task event handler");
            proc_pool.submit(ProcJob {
                kind: ProcJobKind::EventHandler {
                    context: format!("{}/{}", id, event),
                },
                command,
            });
        }
    }

    // === Late detection ===

    /// Flag never-active tasks whose late time has passed. The late event
    /// fires once per instance. Returns ids newly late, for persistence.
    pub fn check_late_tasks(&mut self, pool: &mut TaskPool, proc_pool: &mut SubProcPool, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut newly_late = Vec::new();
        let candidates: Vec<TaskId> = pool
            .tasks()
            .filter(|t| !t.is_late && t.status().is_never_active())
            .map(|t| t.id.clone())
            .collect();
        for id in candidates {
            let Some(offset) = pool.def(&id.name).and_then(|d| d.late_offset_secs) else {
                continue;
            };
            let mean = self.mean_elapsed(&id.name).unwrap_or(0);
            let Some(itask) = pool.get_mut(&id) else { continue };
            let base = itask.id.point.as_time().unwrap_or(itask.created_at);
            let late_time = base + chrono::Duration::seconds(mean + offset);
            itask.late_time = Some(late_time);
            if now > late_time {
                itask.is_late = true;
                itask.state.is_updated = true;
                warn!(id = %id, late_time = %late_time, "task is late");
                newly_late.push(id.clone());
            }
        }
        for id in &newly_late {
            self.dispatch_handlers(pool, id, "late", "task is late", proc_pool);
        }
        newly_late
    }

    // === Persistence ===

    pub fn retry_timer_rows(&self) -> impl Iterator<Item = (&TaskId, &RetryTimer)> {
        self.retry_timers.iter()
    }

    pub fn load_retry_timer(&mut self, id: TaskId, timer: RetryTimer) {
        self.retry_timers.insert(id, timer);
    }

    pub fn has_retry_timers(&self) -> bool {
        !self.retry_timers.is_empty()
    }
}

/// The status a standard lifecycle message implies, if any.
fn implied_status(message: &str) -> Option<TaskStatus> {
    match message {
        OUTPUT_SUBMITTED => Some(TaskStatus::Submitted),
        OUTPUT_STARTED => Some(TaskStatus::Running),
        OUTPUT_SUCCEEDED => Some(TaskStatus::Succeeded),
        OUTPUT_FAILED => Some(TaskStatus::Failed),
        OUTPUT_SUBMIT_FAILED => Some(TaskStatus::SubmitFailed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::{CyclePoint, Interval, Sequence};
    use crate::task::{TaskDef, TaskTrigger};
    use std::collections::HashMap as StdHashMap;

    fn make_pool(retry_delays: Vec<i64>) -> TaskPool {
        let foo = TaskDef {
            name: "foo".into(),
            sequence: Sequence::once(CyclePoint::Integer(1)),
            triggers: vec![],
            outputs: vec!["checkpoint".into()],
            platform: "localhost".into(),
            queue: "default".into(),
            xtriggers: vec![],
            ext_triggers: vec![],
            expire_offset_secs: None,
            late_offset_secs: None,
            retry_delays_secs: retry_delays,
            submission_retry_delays_secs: vec![],
            execution_timeout_secs: None,
            submission_timeout_secs: None,
            simulated_run_secs: 1,
            event_handlers: vec![],
            script: String::new(),
        };
        let bar = TaskDef {
            name: "bar".into(),
            triggers: vec![TaskTrigger {
                parent: "foo".into(),
                output: OUTPUT_SUCCEEDED.into(),
                offset: None,
            }],
            ..foo.clone()
        };
        let defs = StdHashMap::from([("foo".to_string(), foo), ("bar".to_string(), bar)]);
        let mut pool = TaskPool::new(defs, StdHashMap::new(), 3, Some(Interval::Points(1)), false);
        pool.load_from_point(CyclePoint::Integer(1));
        pool.release_runahead_tasks();
        pool
    }

    fn id(name: &str) -> TaskId {
        TaskId::new(CyclePoint::Integer(1), name)
    }

    fn run_lifecycle(mgr: &mut TaskEventsManager, pool: &mut TaskPool, upto: &str) {
        for message in [OUTPUT_SUBMITTED, OUTPUT_STARTED, upto] {
            mgr.process_message(pool, &id("foo"), Some(1), Severity::Info, message, Utc::now());
            if message == upto {
                break;
            }
        }
    }

    #[test]
    fn test_lifecycle_to_success_spawns_child() {
        let mut pool = make_pool(vec![]);
        let mut mgr = TaskEventsManager::new(false);
        run_lifecycle(&mut mgr, &mut pool, OUTPUT_SUCCEEDED);
        // Succeeded task retired, child spawned and satisfied.
        assert!(pool.get(&id("foo")).is_none());
        let bar = pool.get(&id("bar")).expect("child spawned");
        assert!(bar.state.prerequisites_all_satisfied());
    }

    #[test]
    fn test_failure_without_retry_is_terminal() {
        let mut pool = make_pool(vec![]);
        let mut mgr = TaskEventsManager::new(false);
        run_lifecycle(&mut mgr, &mut pool, OUTPUT_FAILED);
        assert_eq!(pool.get(&id("foo")).unwrap().status(), TaskStatus::Failed);
        assert!(!mgr.has_retry_timers());
    }

    #[test]
    fn test_failure_with_retry_returns_to_waiting() {
        let mut pool = make_pool(vec![0]);
        pool.get_mut(&id("foo")).unwrap().submit_num = 1;
        let mut mgr = TaskEventsManager::new(false);
        run_lifecycle(&mut mgr, &mut pool, OUTPUT_FAILED);
        assert_eq!(pool.get(&id("foo")).unwrap().status(), TaskStatus::Waiting);
        assert!(mgr.has_retry_timers());

        // Zero delay: the retry fires on the next event pass.
        let mut proc_pool = SubProcPool::new(1);
        assert!(mgr.process_events(&mut pool, &mut proc_pool, Utc::now()));
        assert!(pool.get(&id("foo")).unwrap().state.is_queued);
    }

    #[test]
    fn test_reversal_detected_for_out_of_order_message() {
        let mut pool = make_pool(vec![]);
        let mut mgr = TaskEventsManager::new(false);
        run_lifecycle(&mut mgr, &mut pool, OUTPUT_STARTED);
        // A "submitted" message arriving after "started" is a reversal.
        let poll = mgr.process_message(
            &mut pool,
            &id("foo"),
            Some(1),
            Severity::Info,
            OUTPUT_SUBMITTED,
            Utc::now(),
        );
        assert!(poll);
        // Status unchanged by the reversal message.
        assert_eq!(pool.get(&id("foo")).unwrap().status(), TaskStatus::Running);
    }

    #[test]
    fn test_stale_submit_number_polls() {
        let mut pool = make_pool(vec![]);
        pool.get_mut(&id("foo")).unwrap().submit_num = 3;
        let mut mgr = TaskEventsManager::new(false);
        let poll = mgr.process_message(
            &mut pool,
            &id("foo"),
            Some(2),
            Severity::Info,
            OUTPUT_STARTED,
            Utc::now(),
        );
        assert!(poll);
    }

    #[test]
    fn test_custom_output_recorded_only_if_declared() {
        let mut pool = make_pool(vec![]);
        let mut mgr = TaskEventsManager::new(false);
        mgr.process_message(&mut pool, &id("foo"), None, Severity::Info, "checkpoint", Utc::now());
        assert!(pool.get(&id("foo")).unwrap().state.outputs.contains(&"checkpoint".to_string()));
        mgr.process_message(&mut pool, &id("foo"), None, Severity::Info, "undeclared", Utc::now());
        assert!(!pool.get(&id("foo")).unwrap().state.outputs.contains(&"undeclared".to_string()));
    }

    #[test]
    fn test_run_time_ring_is_bounded() {
        let mut mgr = TaskEventsManager::new(false);
        for i in 0..20 {
            mgr.record_run_time("foo", i);
        }
        let (_, times) = mgr.run_time_rows().next().unwrap();
        assert_eq!(times.len(), 10);
        assert_eq!(mgr.mean_elapsed("foo"), Some((10..20).sum::<i64>() / 10));
    }

    #[test]
    fn test_late_detection_fires_once() {
        let mut pool = make_pool(vec![]);
        // Make foo late-eligible with a zero offset.
        let mut defs = StdHashMap::new();
        for name in ["foo", "bar"] {
            let mut d = pool.def(name).unwrap().clone();
            d.late_offset_secs = Some(0);
            defs.insert(name.to_string(), d);
        }
        pool.reload_taskdefs(defs, StdHashMap::new(), 3, Some(Interval::Points(1)));
        let mut mgr = TaskEventsManager::new(false);
        let mut proc_pool = SubProcPool::new(1);
        let later = Utc::now() + chrono::Duration::seconds(5);
        let late = mgr.check_late_tasks(&mut pool, &mut proc_pool, later);
        assert_eq!(late, vec![id("foo")]);
        // Second check: already flagged, not reported again.
        assert!(mgr.check_late_tasks(&mut pool, &mut proc_pool, later).is_empty());
    }
}
