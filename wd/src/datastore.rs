//! Data store: per-tick deltas of workflow state, published to subscribers
//!
//! Each tick the scheduler asks the store to collect what changed (dirty
//! task instances, workflow-level flags). Deltas go out over a broadcast
//! channel drained by the server thread; a merged snapshot is kept for
//! point-in-time queries.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::pool::TaskPool;

/// Publication channel capacity; slow subscribers lag rather than block.
const PUBLISH_CAPACITY: usize = 1024;

/// One element of a published delta batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Delta {
    Workflow {
        status: String,
        is_paused: bool,
        is_stalled: bool,
        reloaded: bool,
    },
    Task {
        id: String,
        status: String,
        is_held: bool,
        is_queued: bool,
        is_runahead: bool,
        is_late: bool,
        flow_nums: Vec<u32>,
        submit_num: u32,
    },
    TaskRemoved {
        id: String,
    },
}

/// Workflow-level fields mirrored into the store each tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowView {
    pub status: String,
    pub is_paused: bool,
    pub is_stalled: bool,
}

pub struct DataStore {
    publish_tx: broadcast::Sender<Vec<Delta>>,
    /// Latest task delta per id, for snapshot queries.
    tasks: HashMap<String, Delta>,
    workflow: WorkflowView,
    /// Set when scheduler state changed outside the task pool.
    pub updates_pending: bool,
}

impl DataStore {
    pub fn new() -> Self {
        let (publish_tx, _) = broadcast::channel(PUBLISH_CAPACITY);
        Self {
            publish_tx,
            tasks: HashMap::new(),
            workflow: WorkflowView::default(),
            updates_pending: false,
        }
    }

    /// Re-initialise the data model (startup and reload).
    pub fn initiate_data_model(&mut self, pool: &TaskPool, workflow: WorkflowView) {
        self.tasks.clear();
        self.workflow = workflow;
        for itask in pool.tasks() {
            self.tasks.insert(itask.id.to_string(), task_delta(itask));
        }
        self.updates_pending = true;
    }

    /// Subscribe to published delta batches.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Delta>> {
        self.publish_tx.subscribe()
    }

    /// Sender handle for the publication fan-out (the server subscribes
    /// its clients through this).
    pub fn publish_sender(&self) -> broadcast::Sender<Vec<Delta>> {
        self.publish_tx.clone()
    }

    /// Collect changes since last tick, apply them to the snapshot, and
    /// publish. Returns the batch size.
    pub fn update_data_structure(&mut self, pool: &TaskPool, workflow: WorkflowView, reloaded: bool) -> usize {
        let mut deltas = Vec::new();
        if workflow != self.workflow || reloaded || self.updates_pending {
            deltas.push(Delta::Workflow {
                status: workflow.status.clone(),
                is_paused: workflow.is_paused,
                is_stalled: workflow.is_stalled,
                reloaded,
            });
            self.workflow = workflow;
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(pool.len());
        for itask in pool.tasks() {
            let id = itask.id.to_string();
            if itask.state.is_updated || !self.tasks.contains_key(&id) {
                let delta = task_delta(itask);
                self.tasks.insert(id.clone(), delta.clone());
                deltas.push(delta);
            }
            seen.insert(id);
        }
        // Removed instances.
        let gone: Vec<String> = self
            .tasks
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            self.tasks.remove(&id);
            deltas.push(Delta::TaskRemoved { id });
        }

        self.updates_pending = false;
        if !deltas.is_empty() {
            debug!(count = deltas.len(), "publishing deltas");
            let _ = self.publish_tx.send(deltas.clone());
        }
        deltas.len()
    }

    /// Current merged snapshot as JSON, for RPC queries.
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "workflow": {
                "status": self.workflow.status,
                "is-paused": self.workflow.is_paused,
                "is-stalled": self.workflow.is_stalled,
            },
            "tasks": self.tasks.values().collect::<Vec<_>>(),
        })
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn task_delta(itask: &crate::task::TaskProxy) -> Delta {
    Delta::Task {
        id: itask.id.to_string(),
        status: itask.status().to_string(),
        is_held: itask.state.is_held,
        is_queued: itask.state.is_queued,
        is_runahead: itask.state.is_runahead,
        is_late: itask.is_late,
        flow_nums: itask.flow_nums.iter().copied().collect(),
        submit_num: itask.submit_num,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::{CyclePoint, Interval, Sequence};
    use crate::task::{TaskDef, TaskStatus};

    fn pool() -> TaskPool {
        let def = TaskDef {
            name: "foo".into(),
            sequence: Sequence::once(CyclePoint::Integer(1)),
            triggers: vec![],
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
        };
        let mut pool = TaskPool::new(
            [("foo".to_string(), def)].into(),
            HashMap::new(),
            3,
            Some(Interval::Points(1)),
            false,
        );
        pool.load_from_point(CyclePoint::Integer(1));
        pool
    }

    fn view() -> WorkflowView {
        WorkflowView {
            status: "running".into(),
            is_paused: false,
            is_stalled: false,
        }
    }

    #[test]
    fn test_initial_update_publishes_all_tasks() {
        let mut store = DataStore::new();
        let pool = pool();
        let mut rx = store.subscribe();
        let count = store.update_data_structure(&pool, view(), false);
        assert!(count >= 1);
        let batch = rx.try_recv().unwrap();
        assert!(batch.iter().any(|d| matches!(d, Delta::Task { id, .. } if id == "1/foo")));
    }

    #[test]
    fn test_no_change_publishes_nothing() {
        let mut store = DataStore::new();
        let mut pool = pool();
        store.update_data_structure(&pool, view(), false);
        for itask in pool.tasks_mut() {
            itask.state.is_updated = false;
        }
        let mut rx = store.subscribe();
        let count = store.update_data_structure(&pool, view(), false);
        assert_eq!(count, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_removed_task_emits_removal_delta() {
        let mut store = DataStore::new();
        let mut pool = pool();
        store.update_data_structure(&pool, view(), false);
        pool.remove_tasks(&["1/foo".to_string()]);
        let mut rx = store.subscribe();
        store.update_data_structure(&pool, view(), false);
        let batch = rx.try_recv().unwrap();
        assert!(batch.iter().any(|d| matches!(d, Delta::TaskRemoved { id } if id == "1/foo")));
        assert_eq!(store.task_count(), 0);
    }

    #[test]
    fn test_status_change_republishes_task() {
        let mut store = DataStore::new();
        let mut pool = pool();
        store.update_data_structure(&pool, view(), false);
        for itask in pool.tasks_mut() {
            itask.state.is_updated = false;
        }
        let id = crate::task::TaskId::new(CyclePoint::Integer(1), "foo");
        pool.get_mut(&id).unwrap().state.reset(TaskStatus::Preparing);
        let mut rx = store.subscribe();
        store.update_data_structure(&pool, view(), false);
        let batch = rx.try_recv().unwrap();
        assert!(batch
            .iter()
            .any(|d| matches!(d, Delta::Task { id, status, .. } if id == "1/foo" && status == "preparing")));
    }
}
