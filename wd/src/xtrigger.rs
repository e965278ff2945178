//! xtriggers: named asynchronous predicates gating task readiness
//!
//! An xtrigger is either the built-in wall clock or an external command run
//! through the subprocess pool (exit 0 = satisfied). Calls are keyed by a
//! signature derived from the label and the task's cycle point, so identical
//! calls across instances share one result. The manager fires each
//! signature at most once per cadence and keeps results until no live
//! instance depends on them.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::procpool::{ProcJob, ProcJobKind, SubProcPool};
use crate::task::TaskProxy;

/// Default minimum interval between repeat calls of one signature.
pub const DEFAULT_CADENCE_SECS: u64 = 10;

/// Configured xtrigger, looked up by the labels tasks declare.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct XtriggerDef {
    /// Predicate command; `{point}`, `{name}`, and `{id}` are substituted.
    /// Absent for the built-in wall clock.
    pub command: Option<String>,
    /// Wall-clock trigger: satisfied once now >= point + offset.
    pub wall_clock_offset_secs: Option<i64>,
    /// Minimum seconds between repeat calls.
    pub cadence_secs: Option<u64>,
}

impl XtriggerDef {
    fn is_wall_clock(&self) -> bool {
        self.command.is_none()
    }
}

/// Owns xtrigger evaluation state for the whole workflow.
pub struct XtriggerManager {
    defs: HashMap<String, XtriggerDef>,
    /// Satisfied signatures (shared across instances).
    satisfied: HashSet<String>,
    /// Signatures currently in flight in the subprocess pool.
    active: HashSet<String>,
    last_call: HashMap<String, Instant>,
}

impl XtriggerManager {
    pub fn new(defs: HashMap<String, XtriggerDef>) -> Self {
        Self {
            defs,
            satisfied: HashSet::new(),
            active: HashSet::new(),
            last_call: HashMap::new(),
        }
    }

    /// Replace definitions on workflow reload. Results survive: a satisfied
    /// signature stays satisfied.
    pub fn reload(&mut self, defs: HashMap<String, XtriggerDef>) {
        self.defs = defs;
    }

    /// Signature shared by all calls with the same label and point.
    pub fn signature(label: &str, itask: &TaskProxy) -> String {
        format!("{}({})", label, itask.id.point)
    }

    /// Fire calls for the task's unsatisfied xtriggers. Wall-clock triggers
    /// are evaluated inline; command triggers go through the pool at most
    /// once per cadence.
    pub fn call_xtriggers(&mut self, itask: &TaskProxy, pool: &mut SubProcPool) {
        for (label, sat) in &itask.state.xtriggers {
            if *sat {
                continue;
            }
            let Some(def) = self.defs.get(label) else {
                continue;
            };
            let signature = Self::signature(label, itask);
            if self.satisfied.contains(&signature) || self.active.contains(&signature) {
                continue;
            }
            if def.is_wall_clock() {
                let offset = def.wall_clock_offset_secs.unwrap_or(0);
                // Integer points have no wall-clock; treat as due now.
                let due = itask
                    .id
                    .point
                    .as_time()
                    .map(|t| t + chrono::Duration::seconds(offset))
                    .unwrap_or_else(Utc::now);
                if Utc::now() >= due {
                    debug!(%signature, "wall clock satisfied");
                    self.satisfied.insert(signature);
                }
                continue;
            }
            let cadence = Duration::from_secs(def.cadence_secs.unwrap_or(DEFAULT_CADENCE_SECS));
            if let Some(last) = self.last_call.get(&signature) {
                if last.elapsed() < cadence {
                    continue;
                }
            }
            let command = def
                .command
                .as_deref()
                .unwrap_or_default()
                .replace("{point}", &itask.id.point.to_string())
                .replace("{name}", &itask.id.name)
                .replace("{id}", &itask.id.to_string());
            self.last_call.insert(signature.clone(), Instant::now());
            self.active.insert(signature.clone());
            pool.submit(ProcJob {
                kind: ProcJobKind::Xtrigger { signature },
                command,
            });
        }
    }

    /// Record the outcome of a pooled xtrigger call. Returns the signature
    /// if it became satisfied (for DB persistence).
    pub fn handle_result(&mut self, signature: &str, success: bool) -> Option<String> {
        self.active.remove(signature);
        if success {
            info!(%signature, "xtrigger satisfied");
            self.satisfied.insert(signature.to_string());
            Some(signature.to_string())
        } else {
            debug!(%signature, "xtrigger not satisfied, will retry");
            None
        }
    }

    /// Apply shared results to one task's satisfaction map. Returns true if
    /// anything was newly satisfied.
    pub fn check_xtriggers(&self, itask: &mut TaskProxy) -> bool {
        let mut newly = false;
        for (label, sat) in itask.state.xtriggers.iter_mut() {
            if !*sat && self.satisfied.contains(&Self::signature_of(label, &itask.id)) {
                *sat = true;
                newly = true;
            }
        }
        if newly {
            itask.state.is_updated = true;
        }
        newly
    }

    fn signature_of(label: &str, id: &crate::task::TaskId) -> String {
        format!("{}({})", label, id.point)
    }

    /// Restore a satisfied signature from the DB on restart.
    pub fn load_satisfied(&mut self, signature: String) {
        self.satisfied.insert(signature);
    }

    /// Drop results no live task depends on.
    pub fn housekeep<'a>(&mut self, tasks: impl Iterator<Item = &'a TaskProxy>) {
        let mut needed = HashSet::new();
        for itask in tasks {
            for label in itask.state.xtriggers.keys() {
                needed.insert(Self::signature_of(label, &itask.id));
            }
        }
        self.satisfied.retain(|sig| needed.contains(sig));
        self.last_call.retain(|sig, _| needed.contains(sig));
    }

    pub fn satisfied_signatures(&self) -> impl Iterator<Item = &str> {
        self.satisfied.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::{CyclePoint, Sequence};
    use crate::task::TaskDef;

    fn proxy_with_xtrigger(label: &str) -> TaskProxy {
        let def = TaskDef {
            name: "foo".into(),
            sequence: Sequence::once(CyclePoint::Integer(1)),
            triggers: vec![],
            outputs: vec![],
            platform: "localhost".into(),
            queue: "default".into(),
            xtriggers: vec![label.to_string()],
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
        TaskProxy::new(&def, CyclePoint::Integer(1), [1].into())
    }

    #[test]
    fn test_wall_clock_integer_point_satisfies_inline() {
        let defs = [("clock".to_string(), XtriggerDef::default())].into();
        let mut mgr = XtriggerManager::new(defs);
        let mut pool = SubProcPool::new(1);
        let mut itask = proxy_with_xtrigger("clock");
        mgr.call_xtriggers(&itask, &mut pool);
        assert!(mgr.check_xtriggers(&mut itask));
        assert!(itask.state.xtriggers_all_satisfied());
        assert!(!pool.is_not_done());
    }

    #[tokio::test]
    async fn test_command_fired_once_per_cadence() {
        let defs = [(
            "probe".to_string(),
            XtriggerDef {
                command: Some("true".into()),
                wall_clock_offset_secs: None,
                cadence_secs: Some(3600),
            },
        )]
        .into();
        let mut mgr = XtriggerManager::new(defs);
        let mut pool = SubProcPool::new(1);
        let itask = proxy_with_xtrigger("probe");
        mgr.call_xtriggers(&itask, &mut pool);
        assert!(pool.is_not_done());
        // Second call within the cadence: in-flight, nothing new queued.
        mgr.call_xtriggers(&itask, &mut pool);
        assert_eq!(mgr.active.len(), 1);
    }

    #[test]
    fn test_handle_result_shares_across_instances() {
        let defs = [(
            "probe".to_string(),
            XtriggerDef {
                command: Some("true".into()),
                wall_clock_offset_secs: None,
                cadence_secs: None,
            },
        )]
        .into();
        let mut mgr = XtriggerManager::new(defs);
        let mut itask = proxy_with_xtrigger("probe");
        let signature = XtriggerManager::signature("probe", &itask);
        assert!(mgr.handle_result(&signature, true).is_some());
        assert!(mgr.check_xtriggers(&mut itask));
        // Failure results are not recorded.
        assert!(mgr.handle_result("other(1)", false).is_none());
    }

    #[test]
    fn test_housekeep_drops_unneeded() {
        let mut mgr = XtriggerManager::new(HashMap::new());
        mgr.load_satisfied("stale(99)".into());
        let itask = proxy_with_xtrigger("probe");
        mgr.housekeep(std::iter::once(&itask));
        assert_eq!(mgr.satisfied_signatures().count(), 0);
    }
}
