//! The task pool: every live task instance, and the rules that move them
//!
//! The pool exclusively owns `TaskProxy` instances. It spawns them on graph
//! expansion, stages them behind the runahead limit, queues and releases
//! them for submission, satisfies dependencies when outputs complete, and
//! retires them once they are done and no flow still needs them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use glob::Pattern;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::cycling::{CyclePoint, Interval};
use crate::flow::{FlowManager, FlowSpec, format_flow_nums};
use crate::queues::{Severity, TaskMsg};
use crate::status::StopMode;
use crate::task::{
    OUTPUT_EXPIRED, OUTPUT_SUCCEEDED, TaskDef, TaskId, TaskProxy, TaskStatus,
};

/// Why an instance is being spawned; decides flow inheritance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnReason {
    /// Graph expansion from a parent's output: inherit the parent's flows.
    OnOutput,
    /// Initial load or manual trigger with explicit flows.
    Explicit,
}

/// A restored `task_pool` DB row.
#[derive(Debug, Clone)]
pub struct TaskPoolRow {
    pub point: String,
    pub name: String,
    pub status: String,
    pub flow_nums: Vec<u32>,
    pub submit_num: u32,
    pub is_held: bool,
    pub outputs: Vec<String>,
}

pub struct TaskPool {
    defs: HashMap<String, TaskDef>,
    queue_limits: HashMap<String, usize>,
    runahead_limit: u32,
    /// Interval used to turn the runahead count into a point window.
    limit_interval: Option<Interval>,
    main: BTreeMap<TaskId, TaskProxy>,
    pub flow_mgr: FlowManager,
    runahead_base: Option<CyclePoint>,
    hold_point: Option<CyclePoint>,
    stop_point: Option<CyclePoint>,
    stop_task: Option<TaskId>,
    stop_task_finished: bool,
    simulation: bool,
}

impl TaskPool {
    pub fn new(
        defs: HashMap<String, TaskDef>,
        queue_limits: HashMap<String, usize>,
        runahead_limit: u32,
        limit_interval: Option<Interval>,
        simulation: bool,
    ) -> Self {
        Self {
            defs,
            queue_limits,
            runahead_limit,
            limit_interval,
            main: BTreeMap::new(),
            flow_mgr: FlowManager::new(),
            runahead_base: None,
            hold_point: None,
            stop_point: None,
            stop_task: None,
            stop_task_finished: false,
            simulation,
        }
    }

    // === Accessors ===

    pub fn get(&self, id: &TaskId) -> Option<&TaskProxy> {
        self.main.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskProxy> {
        self.main.get_mut(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskProxy> {
        self.main.values()
    }

    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut TaskProxy> {
        self.main.values_mut()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.main.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    pub fn def(&self, name: &str) -> Option<&TaskDef> {
        self.defs.get(name)
    }

    pub fn stop_point(&self) -> Option<CyclePoint> {
        self.stop_point
    }

    pub fn hold_point(&self) -> Option<CyclePoint> {
        self.hold_point
    }

    pub fn stop_task(&self) -> Option<&TaskId> {
        self.stop_task.as_ref()
    }

    /// Earliest cycle point of any instance in the pool.
    pub fn get_min_point(&self) -> Option<CyclePoint> {
        self.main.keys().next().map(|id| id.point)
    }

    // === Loading ===

    /// Cold/warm start: first instance of every task with no parents at or
    /// after the start point. Downstream tasks spawn on demand.
    pub fn load_from_point(&mut self, start: CyclePoint) {
        let flow = self.flow_mgr.new_flow(&format!("original flow from {}", start));
        let names: Vec<String> = self.defs.keys().cloned().collect();
        for name in names {
            let def = &self.defs[&name];
            if !def.triggers.is_empty() {
                continue;
            }
            if let Some(point) = def.sequence.first_point(&start) {
                self.spawn_instance(&name, point, [flow].into(), SpawnReason::Explicit);
            }
        }
        self.compute_runahead(true);
        info!(tasks = self.main.len(), flow, "task pool loaded");
    }

    /// Restore one instance from its DB row, for a restart.
    pub fn load_db_task_pool_for_restart(&mut self, row: TaskPoolRow) {
        let Ok(point) = row.point.parse::<CyclePoint>() else {
            warn!(point = %row.point, "ignoring task pool row with bad point");
            return;
        };
        let Some(def) = self.defs.get(&row.name) else {
            warn!(name = %row.name, "ignoring task pool row for unknown task");
            return;
        };
        let Ok(status) = row.status.parse::<TaskStatus>() else {
            warn!(status = %row.status, "ignoring task pool row with bad status");
            return;
        };
        let flow_nums: BTreeSet<u32> = row.flow_nums.iter().copied().collect();
        let mut itask = TaskProxy::new(def, point, flow_nums.clone());
        // Preparing never survives a restart: those jobs were not submitted.
        let status = if status == TaskStatus::Preparing {
            TaskStatus::Waiting
        } else {
            status
        };
        itask.state.reset(status);
        itask.submit_num = row.submit_num;
        itask.state.is_held = row.is_held;
        for output in &row.outputs {
            itask.state.add_output(output);
        }
        self.flow_mgr.register_all(&flow_nums);
        info!(id = %itask.id, %status, flows = %format_flow_nums(&itask.flow_nums), "+ restored task");
        self.main.insert(itask.id.clone(), itask);
        self.compute_runahead(true);
        // Restored instances re-satisfy each other from recorded outputs.
        self.resatisfy_prerequisites();
    }

    fn resatisfy_prerequisites(&mut self) {
        let emitted: Vec<(TaskId, Vec<String>)> = self
            .main
            .values()
            .map(|t| (t.id.clone(), t.state.outputs.clone()))
            .collect();
        for itask in self.main.values_mut() {
            for (parent, outputs) in &emitted {
                for output in outputs {
                    itask.state.satisfy_prerequisite(parent, output);
                }
            }
        }
    }

    /// Swap in reloaded definitions. Logs tasks added and removed by the
    /// new config; live instances of removed tasks become orphans and are
    /// retained until they finish.
    pub fn reload_taskdefs(
        &mut self,
        defs: HashMap<String, TaskDef>,
        queue_limits: HashMap<String, usize>,
        runahead_limit: u32,
        limit_interval: Option<Interval>,
    ) {
        let old: HashSet<&String> = self.defs.keys().collect();
        let new: HashSet<&String> = defs.keys().collect();
        for name in new.difference(&old) {
            warn!(task = %name, "added task");
        }
        for name in old.difference(&new) {
            warn!(task = %name, "removed task (live instances retained)");
        }
        self.defs = defs;
        self.queue_limits = queue_limits;
        self.runahead_limit = runahead_limit;
        self.limit_interval = limit_interval;
    }

    // === Spawning ===

    /// Create an instance if it does not exist; merge flows if it does.
    /// New instances start in runahead staging. Returns whether the
    /// instance exists afterwards.
    fn spawn_instance(
        &mut self,
        name: &str,
        point: CyclePoint,
        flow_nums: BTreeSet<u32>,
        reason: SpawnReason,
    ) -> bool {
        let id = TaskId::new(point, name);
        if let Some(existing) = self.main.get_mut(&id) {
            existing.merge_flows(&flow_nums);
            return true;
        }
        let Some(def) = self.defs.get(name) else {
            warn!(task = %name, "cannot spawn unknown task");
            return false;
        };
        if reason == SpawnReason::OnOutput && flow_nums.is_empty() {
            // Flow-none parents do not propagate.
            debug!(id = %id, "not spawning: no flow to propagate");
            return false;
        }
        let mut itask = TaskProxy::new(def, point, flow_nums);
        itask.state.is_runahead = true;
        if let Some(hold_point) = self.hold_point {
            if point > hold_point {
                itask.state.is_held = true;
            }
        }
        debug!(id = %itask.id, flows = %format_flow_nums(&itask.flow_nums), "spawned task");
        self.main.insert(id, itask);
        true
    }

    /// Graph expansion: a parent completed `output`; spawn/satisfy children.
    pub fn spawn_on_output(&mut self, parent: &TaskId, output: &str) {
        let Some(parent_task) = self.main.get(parent) else { return };
        let parent_flows = parent_task.flow_nums.clone();
        let children: Vec<(String, CyclePoint)> = self
            .defs
            .values()
            .flat_map(|def| {
                def.triggers
                    .iter()
                    .filter(|t| t.parent == parent.name && t.output == output)
                    .filter_map(|t| {
                        // The trigger offset maps child point -> parent
                        // point, so reverse it here.
                        let child_point = match &t.offset {
                            Some(offset) => match offset {
                                Interval::Points(n) => parent.point.add(&Interval::Points(-n)).ok()?,
                                Interval::Seconds(s) => parent.point.add(&Interval::Seconds(-s)).ok()?,
                            },
                            None => parent.point,
                        };
                        def.sequence.is_on_sequence(&child_point).then(|| (def.name.clone(), child_point))
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        for (name, point) in children {
            if self.spawn_instance(&name, point, parent_flows.clone(), SpawnReason::OnOutput) {
                let id = TaskId::new(point, &name);
                if let Some(child) = self.main.get_mut(&id) {
                    child.state.satisfy_prerequisite(parent, output);
                }
            }
        }
    }

    /// Retire a finished instance once its children have been spawned.
    /// Failed tasks are retained: they mark the workflow incomplete.
    pub fn remove_if_complete(&mut self, id: &TaskId) -> bool {
        let done = self.main.get(id).is_some_and(|t| t.is_complete());
        if done {
            if self.stop_task.as_ref() == Some(id) {
                self.stop_task_finished = true;
                info!(id = %id, "stop task finished");
            }
            debug!(id = %id, "task completed and removed");
            self.main.remove(id);
            self.compute_runahead(false);
        }
        done
    }

    // === Runahead ===

    /// Recompute the runahead window anchor: the earliest point with at
    /// least one incomplete instance. Returns true if the anchor moved.
    pub fn compute_runahead(&mut self, force: bool) -> bool {
        let base = self
            .main
            .values()
            .filter(|t| !t.is_complete())
            .map(|t| t.id.point)
            .min();
        if base != self.runahead_base || force {
            self.runahead_base = base;
            return true;
        }
        false
    }

    fn runahead_limit_point(&self) -> Option<CyclePoint> {
        let base = self.runahead_base?;
        let interval = self.limit_interval?;
        let mut limit = base;
        for _ in 0..self.runahead_limit {
            match limit.add(&interval) {
                Ok(next) => limit = next,
                Err(_) => return None,
            }
        }
        Some(limit)
    }

    /// Promote staged instances into the live pool, up to the runahead
    /// window and the stop point. Parentless tasks auto-spawn their next
    /// instance on release. Returns true if anything was released.
    pub fn release_runahead_tasks(&mut self) -> bool {
        let limit_point = self.runahead_limit_point();
        let mut released = Vec::new();
        for itask in self.main.values() {
            if !itask.state.is_runahead {
                continue;
            }
            if let Some(limit) = limit_point {
                if itask.id.point > limit {
                    continue;
                }
            }
            if let Some(stop) = self.stop_point {
                if itask.id.point > stop {
                    continue;
                }
            }
            released.push(itask.id.clone());
        }
        for id in &released {
            if let Some(itask) = self.main.get_mut(id) {
                itask.state.is_runahead = false;
                itask.state.is_updated = true;
                debug!(id = %id, "released from runahead");
            }
            // Auto-spawn the next instance of parentless tasks.
            let (next, flows) = {
                let itask = &self.main[id];
                let def = &self.defs[&id.name];
                if def.triggers.is_empty() {
                    (def.sequence.next_point(&id.point), itask.flow_nums.clone())
                } else {
                    (None, BTreeSet::new())
                }
            };
            if let Some(next_point) = next {
                self.spawn_instance(&id.name, next_point, flows, SpawnReason::Explicit);
            }
        }
        !released.is_empty()
    }

    // === Queue management ===

    /// Put a ready task on its internal queue.
    pub fn queue_task(&mut self, id: &TaskId) {
        if let Some(itask) = self.main.get_mut(id) {
            if !itask.state.is_queued && itask.is_ready_to_run() {
                itask.state.is_queued = true;
                itask.state.is_updated = true;
                debug!(id = %id, "queued");
            }
        }
    }

    /// Queue every ready task (used after trigger evaluation).
    pub fn queue_ready_tasks(&mut self) {
        let ready: Vec<TaskId> = self
            .main
            .values()
            .filter(|t| !t.state.is_queued && t.is_ready_to_run())
            .map(|t| t.id.clone())
            .collect();
        for id in ready {
            self.queue_task(&id);
        }
    }

    /// Release queued tasks for submission, honouring per-queue limits.
    /// Released tasks become `preparing` with a bumped submit counter.
    /// Iteration order (point, then name) fixes the dispatch tie-break.
    pub fn release_queued_tasks(&mut self) -> Vec<TaskId> {
        let mut active_counts: HashMap<String, usize> = HashMap::new();
        for itask in self.main.values() {
            let status = itask.status();
            if status == TaskStatus::Preparing || status.is_active() {
                if let Some(def) = self.defs.get(&itask.id.name) {
                    *active_counts.entry(def.queue.clone()).or_default() += 1;
                }
            }
        }
        let mut released = Vec::new();
        let queued: Vec<TaskId> = self
            .main
            .values()
            .filter(|t| t.state.is_queued)
            .map(|t| t.id.clone())
            .collect();
        for id in queued {
            let queue = self
                .defs
                .get(&id.name)
                .map(|d| d.queue.clone())
                .unwrap_or_else(|| "default".to_string());
            let limit = self.queue_limits.get(&queue).copied().unwrap_or(0);
            let active = active_counts.entry(queue).or_default();
            if limit > 0 && *active >= limit {
                continue;
            }
            *active += 1;
            let Some(itask) = self.main.get_mut(&id) else { continue };
            itask.state.is_queued = false;
            itask.state.reset(TaskStatus::Preparing);
            itask.submit_num += 1;
            itask.is_manual_submit = false;
            released.push(id);
        }
        released
    }

    /// Expire waiting tasks whose expiry time has passed. Returns the
    /// expired ids for event dispatch.
    pub fn set_expired_tasks(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut expired = Vec::new();
        for itask in self.main.values_mut() {
            if itask.status() == TaskStatus::Waiting
                && itask.expire_time.is_some_and(|t| now > t)
            {
                warn!(id = %itask.id, "task expired");
                itask.state.reset(TaskStatus::Expired);
                itask.state.is_queued = false;
                itask.state.add_output(OUTPUT_EXPIRED);
                expired.push(itask.id.clone());
            }
        }
        for id in &expired {
            self.spawn_on_output(id, OUTPUT_EXPIRED);
        }
        expired
    }

    // === Hold / release ===

    /// Hold matching instances. Returns the number of warnings.
    pub fn hold_tasks(&mut self, globs: &[String]) -> u32 {
        let (ids, warnings) = self.filter_task_proxies(globs);
        for id in ids {
            if let Some(itask) = self.main.get_mut(&id) {
                if !itask.state.is_held {
                    itask.state.is_held = true;
                    itask.state.is_queued = false;
                    itask.state.is_updated = true;
                    info!(id = %id, "held");
                }
            }
        }
        warnings
    }

    /// Release matching held instances. Returns the number of warnings.
    pub fn release_held_tasks(&mut self, globs: &[String]) -> u32 {
        let (ids, warnings) = self.filter_task_proxies(globs);
        for id in ids {
            if let Some(itask) = self.main.get_mut(&id) {
                if itask.state.is_held {
                    itask.state.is_held = false;
                    itask.state.is_updated = true;
                    info!(id = %id, "released");
                }
            }
        }
        warnings
    }

    /// Hold everything after the given point, now and on future spawns.
    pub fn set_hold_point(&mut self, point: CyclePoint) {
        self.hold_point = Some(point);
        for itask in self.main.values_mut() {
            if itask.id.point > point && !itask.state.is_held {
                itask.state.is_held = true;
                itask.state.is_queued = false;
                itask.state.is_updated = true;
            }
        }
    }

    /// Release all held tasks and clear the hold point.
    pub fn release_hold_point(&mut self) {
        self.hold_point = None;
        for itask in self.main.values_mut() {
            if itask.state.is_held {
                itask.state.is_held = false;
                itask.state.is_updated = true;
            }
        }
    }

    // === Stop conditions ===

    /// Returns true if the stop point actually changed.
    pub fn set_stop_point(&mut self, point: CyclePoint) -> bool {
        if self.stop_point == Some(point) {
            info!(%point, "stop point unchanged");
            return false;
        }
        info!(%point, "setting stop point");
        self.stop_point = Some(point);
        true
    }

    pub fn clear_stop_point(&mut self) {
        self.stop_point = None;
    }

    pub fn set_stop_task(&mut self, id: TaskId) {
        info!(%id, "setting stop task");
        self.stop_task = Some(id);
        self.stop_task_finished = false;
    }

    /// True once the stop task has finished (checked each tick).
    pub fn stop_task_done(&mut self) -> bool {
        if self.stop_task.is_none() {
            return false;
        }
        if self.stop_task_finished {
            self.stop_task = None;
            self.stop_task_finished = false;
            return true;
        }
        // The stop task may still be in the pool, already succeeded.
        if let Some(id) = &self.stop_task {
            if self.main.get(id).is_some_and(|t| t.is_complete()) {
                self.stop_task = None;
                self.stop_task_finished = false;
                return true;
            }
        }
        false
    }

    /// Drop a flow: remove its number everywhere; retire instances left
    /// with no flows unless they are actively running.
    pub fn stop_flow(&mut self, flow_num: u32) {
        info!(flow = flow_num, "stopping flow");
        let mut to_remove = Vec::new();
        for itask in self.main.values_mut() {
            if itask.flow_nums.remove(&flow_num) {
                itask.state.is_updated = true;
                if itask.flow_nums.is_empty() && !itask.status().is_active() {
                    to_remove.push(itask.id.clone());
                }
            }
        }
        for id in to_remove {
            debug!(id = %id, "removed with stopped flow");
            self.main.remove(&id);
        }
        self.compute_runahead(false);
    }

    // === Manual operations ===

    /// Forcibly ready matching instances with the given flow assignment.
    /// Returns the number of warnings logged.
    pub fn force_trigger_tasks(
        &mut self,
        globs: &[String],
        flow: &FlowSpec,
        flow_wait: bool,
        flow_descr: Option<&str>,
    ) -> u32 {
        let descr = flow_descr.unwrap_or("manual trigger");
        let (mut ids, mut warnings) = self.filter_task_proxies(globs);
        // Non-glob items that matched nothing may name future instances.
        for item in globs {
            if item.contains('*') || item.contains('?') {
                continue;
            }
            if let Ok(id) = item.parse::<TaskId>() {
                if !self.main.contains_key(&id) && self.defs.contains_key(&id.name) {
                    let flows = self.flows_for_spawn(flow, descr);
                    if self.spawn_instance(&id.name, id.point, flows, SpawnReason::Explicit) {
                        ids.push(id);
                        warnings = warnings.saturating_sub(1);
                    }
                }
            }
        }
        for id in ids {
            let flows = self.flows_for_trigger(&id, flow, descr);
            let Some(itask) = self.main.get_mut(&id) else { continue };
            if itask.status() != TaskStatus::Waiting {
                warn!(id = %id, status = %itask.status(), "cannot trigger a non-waiting task");
                warnings += 1;
                continue;
            }
            itask.flow_nums = flows;
            itask.flow_wait = flow_wait;
            itask.is_manual_submit = true;
            itask.state.is_runahead = false;
            itask.state.satisfy_all();
            info!(id = %id, flows = %format_flow_nums(&itask.flow_nums), "force-triggered");
            self.queue_task(&id);
        }
        warnings
    }

    fn flows_for_spawn(&mut self, flow: &FlowSpec, descr: &str) -> BTreeSet<u32> {
        match flow {
            FlowSpec::All => {
                let mut all: BTreeSet<u32> = BTreeSet::new();
                for itask in self.main.values() {
                    all.extend(itask.flow_nums.iter().copied());
                }
                if all.is_empty() {
                    all.insert(self.flow_mgr.new_flow(descr));
                }
                all
            }
            FlowSpec::New => [self.flow_mgr.new_flow(descr)].into(),
            FlowSpec::None => BTreeSet::new(),
            FlowSpec::Numbers(nums) => {
                let set: BTreeSet<u32> = nums.iter().copied().collect();
                for num in &set {
                    self.flow_mgr.register(*num, Some(descr));
                }
                set
            }
        }
    }

    fn flows_for_trigger(&mut self, id: &TaskId, flow: &FlowSpec, descr: &str) -> BTreeSet<u32> {
        match flow {
            // Keep the instance's own flows for "all".
            FlowSpec::All => self
                .main
                .get(id)
                .map(|t| t.flow_nums.clone())
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| self.flows_for_spawn(flow, descr)),
            other => self.flows_for_spawn(other, descr),
        }
    }

    /// Spawn downstream tasks as if `outputs` had been emitted.
    pub fn force_spawn_children(&mut self, items: &[String], outputs: &[String], flow_num: Option<u32>) -> u32 {
        let outputs = if outputs.is_empty() {
            vec![OUTPUT_SUCCEEDED.to_string()]
        } else {
            outputs.to_vec()
        };
        let (ids, warnings) = self.filter_task_proxies(items);
        for id in ids {
            if let Some(num) = flow_num {
                self.flow_mgr.register(num, None);
                if let Some(itask) = self.main.get_mut(&id) {
                    itask.flow_nums.insert(num);
                }
            }
            for output in &outputs {
                if let Some(itask) = self.main.get_mut(&id) {
                    itask.state.add_output(output);
                }
                self.spawn_on_output(&id, output);
            }
        }
        warnings
    }

    /// Delete matching instances. Returns the number of warnings.
    pub fn remove_tasks(&mut self, globs: &[String]) -> u32 {
        let (ids, warnings) = self.filter_task_proxies(globs);
        for id in ids {
            info!(id = %id, "removed task");
            self.main.remove(&id);
        }
        self.compute_runahead(false);
        warnings
    }

    /// Match task-id globs against the pool. Patterns match the full
    /// `point/name` id or the bare task name. Returns matched ids and the
    /// number of items that matched nothing (each logged once).
    pub fn filter_task_proxies(&self, globs: &[String]) -> (Vec<TaskId>, u32) {
        let mut ids = Vec::new();
        let mut warnings = 0;
        for item in globs {
            let Ok(pattern) = Pattern::new(item) else {
                warn!(item = %item, "bad task pattern");
                warnings += 1;
                continue;
            };
            let matched: Vec<TaskId> = self
                .main
                .keys()
                .filter(|id| pattern.matches(&id.to_string()) || pattern.matches(&id.name))
                .cloned()
                .collect();
            if matched.is_empty() {
                warn!(item = %item, "no active tasks matching");
                warnings += 1;
            } else {
                ids.extend(matched);
            }
        }
        ids.sort();
        ids.dedup();
        (ids, warnings)
    }

    // === Workflow-state queries ===

    /// Any instance in the submission pipeline or with a live job.
    pub fn has_active_tasks(&self) -> bool {
        self.main
            .values()
            .any(|t| t.status() == TaskStatus::Preparing || t.status().is_active())
    }

    pub fn any_task_failed(&self) -> bool {
        self.main
            .values()
            .any(|t| matches!(t.status(), TaskStatus::Failed | TaskStatus::SubmitFailed))
    }

    /// Stalled: nothing active or able to become active, but incomplete
    /// work remains. Unsatisfied xtriggers do not count as a stall: they
    /// may still fire.
    pub fn is_stalled(&self) -> bool {
        let mut incomplete = false;
        for itask in self.main.values() {
            let status = itask.status();
            if status == TaskStatus::Preparing || status.is_active() {
                return false;
            }
            match status {
                TaskStatus::Waiting => {
                    if itask.state.is_queued || itask.is_ready_to_run() {
                        return false;
                    }
                    if itask.state.is_runahead && itask.state.prerequisites_all_satisfied() {
                        // Will be released by the runahead window.
                        return false;
                    }
                    if itask.state.prerequisites_all_satisfied()
                        && (!itask.state.xtriggers_all_satisfied()
                            || !itask.state.external_triggers_all_satisfied())
                    {
                        // Waiting on external events, not stalled.
                        return false;
                    }
                    if !itask.state.is_held && !itask.state.prerequisites_all_satisfied() {
                        incomplete = true;
                    }
                }
                TaskStatus::Failed | TaskStatus::SubmitFailed => incomplete = true,
                _ => {}
            }
        }
        if incomplete {
            for itask in self.main.values() {
                for prereq in &itask.state.prerequisites {
                    if !prereq.satisfied {
                        warn!(id = %itask.id, waiting_on = %prereq.parent, output = %prereq.output,
                              "unsatisfied prerequisite");
                    }
                }
            }
        }
        incomplete
    }

    /// Whether the workflow may stop right now in the given mode.
    pub fn can_stop(&self, stop_mode: Option<StopMode>) -> bool {
        match stop_mode {
            None => false,
            Some(StopMode::RequestNowNow) => true,
            Some(StopMode::RequestNow) => true,
            Some(_) => !self.has_active_tasks(),
        }
    }

    /// Log active tasks being orphaned by shutdown.
    pub fn warn_stop_orphans(&self) {
        for itask in self.main.values() {
            if itask.status().is_active() {
                warn!(id = %itask.id, status = %itask.status(), "orphaning active task at shutdown");
            }
        }
    }

    /// Simulation mode: running tasks finish after their simulated run
    /// length, delivered as ordinary task messages. Returns true if any
    /// message was injected.
    pub fn sim_time_check(&self, message_tx: &UnboundedSender<TaskMsg>, now: DateTime<Utc>) -> bool {
        if !self.simulation {
            return false;
        }
        let mut changed = false;
        for itask in self.main.values() {
            if itask.status() != TaskStatus::Running {
                continue;
            }
            let Some(def) = self.defs.get(&itask.id.name) else { continue };
            let Some(started) = itask.started_at else { continue };
            if now >= started + chrono::Duration::seconds(def.simulated_run_secs) {
                let _ = message_tx.send(TaskMsg::new(
                    itask.job_identity(),
                    Severity::Info,
                    OUTPUT_SUCCEEDED,
                ));
                changed = true;
            }
        }
        changed
    }

    /// Rows for the `task_pool` table.
    pub fn db_rows(&self) -> Vec<TaskPoolRow> {
        self.main
            .values()
            .map(|t| TaskPoolRow {
                point: t.id.point.to_string(),
                name: t.id.name.clone(),
                status: t.status().to_string(),
                flow_nums: t.flow_nums.iter().copied().collect(),
                submit_num: t.submit_num,
                is_held: t.state.is_held,
                outputs: t.state.outputs.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::Sequence;
    use crate::task::TaskTrigger;

    fn def(name: &str, triggers: Vec<TaskTrigger>) -> TaskDef {
        TaskDef {
            name: name.into(),
            sequence: Sequence {
                start: CyclePoint::Integer(1),
                stop: Some(CyclePoint::Integer(10)),
                interval: Some(Interval::Points(1)),
            },
            triggers,
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

    fn trigger(parent: &str) -> TaskTrigger {
        TaskTrigger {
            parent: parent.into(),
            output: OUTPUT_SUCCEEDED.into(),
            offset: None,
        }
    }

    fn two_task_pool() -> TaskPool {
        let defs = HashMap::from([
            ("foo".to_string(), def("foo", vec![])),
            ("bar".to_string(), def("bar", vec![trigger("foo")])),
        ]);
        let mut pool = TaskPool::new(defs, HashMap::new(), 3, Some(Interval::Points(1)), false);
        pool.load_from_point(CyclePoint::Integer(1));
        pool
    }

    fn id(point: i64, name: &str) -> TaskId {
        TaskId::new(CyclePoint::Integer(point), name)
    }

    #[test]
    fn test_load_from_point_spawns_parentless_only() {
        let pool = two_task_pool();
        assert!(pool.get(&id(1, "foo")).is_some());
        // bar has a parent: spawned on demand only.
        assert!(pool.get(&id(1, "bar")).is_none());
    }

    #[test]
    fn test_flow_set_nonempty_in_pool() {
        let pool = two_task_pool();
        for itask in pool.tasks() {
            assert!(!itask.flow_nums.is_empty());
        }
    }

    #[test]
    fn test_release_runahead_spawns_next_instance() {
        let mut pool = two_task_pool();
        assert!(pool.release_runahead_tasks());
        let released = pool.get(&id(1, "foo")).unwrap();
        assert!(!released.state.is_runahead);
        // Next instance auto-spawned into runahead.
        let next = pool.get(&id(2, "foo")).unwrap();
        assert!(next.state.is_runahead);
    }

    #[test]
    fn test_runahead_window_bounds_release() {
        let mut pool = two_task_pool();
        // Release repeatedly: instances beyond base+3 stay in runahead.
        for _ in 0..10 {
            pool.release_runahead_tasks();
        }
        let beyond: Vec<_> = pool
            .tasks()
            .filter(|t| !t.state.is_runahead && t.id.point > CyclePoint::Integer(4))
            .collect();
        assert!(beyond.is_empty(), "released beyond the runahead window");
    }

    #[test]
    fn test_spawn_on_output_satisfies_child() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        pool.spawn_on_output(&id(1, "foo"), OUTPUT_SUCCEEDED);
        let bar = pool.get(&id(1, "bar")).expect("child spawned");
        assert!(bar.state.prerequisites_all_satisfied());
        // Child inherits the parent's flows.
        assert_eq!(bar.flow_nums, pool.get(&id(1, "foo")).unwrap().flow_nums);
    }

    #[test]
    fn test_queue_and_release_respects_limit() {
        let defs = HashMap::from([
            ("a".to_string(), def("a", vec![])),
            ("b".to_string(), def("b", vec![])),
        ]);
        let limits = HashMap::from([("default".to_string(), 1)]);
        let mut pool = TaskPool::new(defs, limits, 3, Some(Interval::Points(1)), false);
        pool.load_from_point(CyclePoint::Integer(1));
        pool.release_runahead_tasks();
        pool.queue_ready_tasks();
        let released = pool.release_queued_tasks();
        assert_eq!(released.len(), 1);
        // One preparing task occupies the queue slot.
        assert!(pool.release_queued_tasks().is_empty());
        let itask = pool.get(&released[0]).unwrap();
        assert_eq!(itask.status(), TaskStatus::Preparing);
        assert_eq!(itask.submit_num, 1);
    }

    #[test]
    fn test_hold_excludes_from_release() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        pool.hold_tasks(&["foo".to_string()]);
        pool.queue_ready_tasks();
        assert!(pool.release_queued_tasks().is_empty());
        pool.release_held_tasks(&["foo".to_string()]);
        pool.queue_ready_tasks();
        assert_eq!(pool.release_queued_tasks().len(), 1);
    }

    #[test]
    fn test_hold_then_release_roundtrip_is_noop() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        let held_before: Vec<bool> = pool.tasks().map(|t| t.state.is_held).collect();
        pool.hold_tasks(&["*".to_string()]);
        pool.release_held_tasks(&["*".to_string()]);
        let held_after: Vec<bool> = pool.tasks().map(|t| t.state.is_held).collect();
        assert_eq!(held_before, held_after);
    }

    #[test]
    fn test_hold_point_holds_future_spawns() {
        let mut pool = two_task_pool();
        pool.set_hold_point(CyclePoint::Integer(1));
        pool.release_runahead_tasks();
        // 2/foo spawned past the hold point: held on spawn.
        let next = pool.get(&id(2, "foo")).unwrap();
        assert!(next.state.is_held);
    }

    #[test]
    fn test_force_trigger_invalid_flow_rejected() {
        // Mixed flow values are rejected before reaching the pool.
        assert!(FlowSpec::parse(&["ALL".into(), "1".into()]).is_err());
    }

    #[test]
    fn test_force_trigger_new_flow() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        let warnings = pool.force_trigger_tasks(
            &["1/foo".to_string()],
            &FlowSpec::New,
            false,
            Some("manual"),
        );
        assert_eq!(warnings, 0);
        let foo = pool.get(&id(1, "foo")).unwrap();
        assert!(foo.state.is_queued);
        assert_eq!(foo.flow_nums, [2].into());
        assert_eq!(pool.flow_mgr.description(2), Some("manual"));
    }

    #[test]
    fn test_force_trigger_spawns_future_instance() {
        let mut pool = two_task_pool();
        let warnings = pool.force_trigger_tasks(&["5/bar".to_string()], &FlowSpec::All, false, None);
        assert_eq!(warnings, 0);
        assert!(pool.get(&id(5, "bar")).is_some());
    }

    #[test]
    fn test_stop_flow_removes_flowless() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        pool.stop_flow(1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_stop_task_done() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        pool.set_stop_task(id(1, "foo"));
        assert!(!pool.stop_task_done());
        pool.get_mut(&id(1, "foo")).unwrap().state.reset(TaskStatus::Succeeded);
        assert!(pool.stop_task_done());
        // One-shot.
        assert!(!pool.stop_task_done());
    }

    #[test]
    fn test_is_stalled_on_failure() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        assert!(!pool.is_stalled());
        pool.get_mut(&id(1, "foo")).unwrap().state.reset(TaskStatus::Failed);
        // 2/foo is still releasable; drop it to force the stall.
        pool.remove_tasks(&["2/foo".to_string()]);
        assert!(pool.is_stalled());
    }

    #[test]
    fn test_can_stop_by_mode() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        pool.get_mut(&id(1, "foo")).unwrap().state.reset(TaskStatus::Running);
        assert!(!pool.can_stop(Some(StopMode::RequestClean)));
        assert!(pool.can_stop(Some(StopMode::RequestNowNow)));
        assert!(!pool.can_stop(None));
        pool.get_mut(&id(1, "foo")).unwrap().state.reset(TaskStatus::Succeeded);
        assert!(pool.can_stop(Some(StopMode::RequestClean)));
    }

    #[test]
    fn test_restart_roundtrip_restores_state() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        {
            let foo = pool.get_mut(&id(1, "foo")).unwrap();
            foo.submit_num = 2;
            foo.state.is_held = true;
            foo.state.reset(TaskStatus::Running);
        }
        let rows = pool.db_rows();

        let defs = HashMap::from([
            ("foo".to_string(), def("foo", vec![])),
            ("bar".to_string(), def("bar", vec![trigger("foo")])),
        ]);
        let mut restored = TaskPool::new(defs, HashMap::new(), 3, Some(Interval::Points(1)), false);
        for row in rows {
            restored.load_db_task_pool_for_restart(row);
        }
        let foo = restored.get(&id(1, "foo")).unwrap();
        assert_eq!(foo.status(), TaskStatus::Running);
        assert_eq!(foo.submit_num, 2);
        assert!(foo.state.is_held);
        assert_eq!(foo.flow_nums, [1].into());
        // Flow counter restored: next flow is 2.
        assert_eq!(restored.flow_mgr.new_flow("x"), 2);
    }

    #[test]
    fn test_restart_resets_preparing_to_waiting() {
        let defs = HashMap::from([("foo".to_string(), def("foo", vec![]))]);
        let mut pool = TaskPool::new(defs, HashMap::new(), 3, None, false);
        pool.load_db_task_pool_for_restart(TaskPoolRow {
            point: "1".into(),
            name: "foo".into(),
            status: "preparing".into(),
            flow_nums: vec![1],
            submit_num: 1,
            is_held: false,
            outputs: vec![],
        });
        assert_eq!(pool.get(&id(1, "foo")).unwrap().status(), TaskStatus::Waiting);
    }

    #[test]
    fn test_filter_task_proxies_warnings() {
        let pool = two_task_pool();
        let (ids, warnings) = pool.filter_task_proxies(&["*".to_string(), "1/nope".to_string()]);
        assert!(!ids.is_empty());
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_expire_tasks() {
        let mut defs = HashMap::from([("foo".to_string(), def("foo", vec![]))]);
        defs.get_mut("foo").unwrap().expire_offset_secs = Some(0);
        let mut pool = TaskPool::new(defs, HashMap::new(), 3, None, false);
        pool.load_from_point(CyclePoint::Integer(1));
        // Integer points anchor expiry at instance creation time.
        let expired = pool.set_expired_tasks(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(pool.get(&id(1, "foo")).unwrap().status(), TaskStatus::Expired);
    }

    #[test]
    fn test_remove_if_complete() {
        let mut pool = two_task_pool();
        pool.release_runahead_tasks();
        pool.get_mut(&id(1, "foo")).unwrap().state.reset(TaskStatus::Succeeded);
        assert!(pool.remove_if_complete(&id(1, "foo")));
        assert!(pool.get(&id(1, "foo")).is_none());
        // Failed tasks are retained.
        pool.get_mut(&id(2, "foo")).unwrap().state.reset(TaskStatus::Failed);
        assert!(!pool.remove_if_complete(&id(2, "foo")));
    }
}
