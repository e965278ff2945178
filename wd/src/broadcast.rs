//! Broadcast overrides and external triggers
//!
//! Broadcasts are point-scoped runtime overrides ("from point P, task X
//! gets these settings") that expire once the workflow has moved past their
//! point. External triggers are workflow-external events, matched by name
//! against tasks that declare them.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};

use crate::cycling::CyclePoint;
use crate::queues::ExtTriggerMsg;
use crate::task::TaskProxy;

/// Namespace key for broadcasts that apply to every point.
pub const ALL_POINTS: &str = "*";

/// Owns broadcast state and the set of external triggers seen so far.
#[derive(Debug, Default)]
pub struct BroadcastManager {
    /// point (or `*`) -> task name (or `root`) -> settings.
    broadcasts: HashMap<String, HashMap<String, Value>>,
    /// External trigger name -> producer-supplied ids seen.
    ext_triggers: HashMap<String, Vec<String>>,
}

impl BroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a broadcast override.
    pub fn put_broadcast(&mut self, point: &str, namespace: &str, settings: Value) {
        info!(point, namespace, "broadcast set");
        self.broadcasts
            .entry(point.to_string())
            .or_default()
            .insert(namespace.to_string(), settings);
    }

    /// Settings applying to one task instance: all-points first, then the
    /// instance's own point (which wins key-by-key).
    pub fn get_broadcast(&self, itask: &TaskProxy) -> HashMap<String, Value> {
        let mut merged = HashMap::new();
        for point_key in [ALL_POINTS.to_string(), itask.id.point.to_string()] {
            if let Some(by_namespace) = self.broadcasts.get(&point_key) {
                for namespace in ["root", itask.id.name.as_str()] {
                    if let Some(Value::Object(map)) = by_namespace.get(namespace) {
                        for (key, value) in map {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
        merged
    }

    /// Expire broadcasts scoped to points below the minimum active point.
    pub fn expire_broadcast(&mut self, min_point: Option<&CyclePoint>) {
        let Some(min_point) = min_point else { return };
        let before = self.broadcasts.len();
        self.broadcasts.retain(|point_key, _| {
            if point_key == ALL_POINTS {
                return true;
            }
            match point_key.parse::<CyclePoint>() {
                Ok(point) => point >= *min_point,
                Err(_) => true,
            }
        });
        if self.broadcasts.len() != before {
            debug!(expired = before - self.broadcasts.len(), %min_point, "expired broadcasts");
        }
    }

    /// Record an external trigger event from the ingest queue.
    pub fn register_ext_trigger(&mut self, msg: ExtTriggerMsg) {
        info!(trigger = %msg.trigger, id = %msg.id, "external trigger received");
        self.ext_triggers.entry(msg.trigger).or_default().push(msg.id);
    }

    /// Satisfy any of the task's declared external triggers that have been
    /// seen. Returns true if one was newly satisfied.
    pub fn check_ext_triggers(&self, itask: &mut TaskProxy) -> bool {
        let mut newly = false;
        for (name, sat) in itask.state.external_triggers.iter_mut() {
            if !*sat && self.ext_triggers.contains_key(name) {
                *sat = true;
                newly = true;
            }
        }
        if newly {
            itask.state.is_updated = true;
        }
        newly
    }

    /// Rows for persistence: (point, namespace, settings JSON).
    pub fn broadcast_rows(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.broadcasts.iter().flat_map(|(point, by_ns)| {
            by_ns
                .iter()
                .map(move |(namespace, settings)| (point.as_str(), namespace.as_str(), settings))
        })
    }

    /// Restore one broadcast row from the DB.
    pub fn load_broadcast_row(&mut self, point: &str, namespace: &str, settings: Value) {
        self.broadcasts
            .entry(point.to_string())
            .or_default()
            .insert(namespace.to_string(), settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::Sequence;
    use crate::task::TaskDef;
    use serde_json::json;

    fn proxy(point: i64, ext: &[&str]) -> TaskProxy {
        let def = TaskDef {
            name: "foo".into(),
            sequence: Sequence::once(CyclePoint::Integer(point)),
            triggers: vec![],
            outputs: vec![],
            platform: "localhost".into(),
            queue: "default".into(),
            xtriggers: vec![],
            ext_triggers: ext.iter().map(|s| s.to_string()).collect(),
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
        TaskProxy::new(&def, CyclePoint::Integer(point), [1].into())
    }

    #[test]
    fn test_broadcast_merge_order() {
        let mut mgr = BroadcastManager::new();
        mgr.put_broadcast(ALL_POINTS, "root", json!({"A": "global", "B": "global"}));
        mgr.put_broadcast("1", "foo", json!({"B": "specific"}));
        let merged = mgr.get_broadcast(&proxy(1, &[]));
        assert_eq!(merged["A"], "global");
        assert_eq!(merged["B"], "specific");
    }

    #[test]
    fn test_expire_broadcast_below_min_point() {
        let mut mgr = BroadcastManager::new();
        mgr.put_broadcast("1", "foo", json!({"X": 1}));
        mgr.put_broadcast("5", "foo", json!({"X": 2}));
        mgr.put_broadcast(ALL_POINTS, "root", json!({"X": 3}));
        mgr.expire_broadcast(Some(&CyclePoint::Integer(3)));
        assert!(!mgr.get_broadcast(&proxy(1, &[])).is_empty()); // `*` survives
        assert_eq!(mgr.broadcast_rows().count(), 2);
    }

    #[test]
    fn test_ext_trigger_matching() {
        let mut mgr = BroadcastManager::new();
        let mut itask = proxy(1, &["obs-arrived"]);
        assert!(!mgr.check_ext_triggers(&mut itask));
        mgr.register_ext_trigger(ExtTriggerMsg {
            trigger: "obs-arrived".into(),
            id: "batch-42".into(),
        });
        assert!(mgr.check_ext_triggers(&mut itask));
        assert!(itask.state.external_triggers_all_satisfied());
        // Idempotent.
        assert!(!mgr.check_ext_triggers(&mut itask));
    }
}
