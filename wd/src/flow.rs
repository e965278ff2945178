//! Flow numbers
//!
//! A flow is one traversal of the graph, identified by a positive integer.
//! Task instances carry the set of flows they belong to; children inherit
//! the union of their parents' flow numbers. Flow "none" marks a one-off
//! spawn that does not propagate to children.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::WorkflowError;

/// Operator flow selector for manual triggering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowSpec {
    /// All active flows (the default).
    All,
    /// Start a fresh flow.
    New,
    /// No flow: the spawned task will not propagate onwards.
    None,
    /// Specific existing flow numbers.
    Numbers(Vec<u32>),
}

impl FlowSpec {
    /// Parse the operator's flow items, e.g. `["all"]`, `["new"]`,
    /// `["1", "3"]`. Mixing a keyword with numbers is rejected.
    pub fn parse(items: &[String]) -> Result<FlowSpec, WorkflowError> {
        if items.is_empty() {
            return Ok(FlowSpec::All);
        }
        let lowered: Vec<String> = items.iter().map(|s| s.to_ascii_lowercase()).collect();
        let is_keyword = |s: &str| matches!(s, "all" | "new" | "none");
        if lowered.iter().any(|s| is_keyword(s)) {
            if lowered.len() > 1 {
                return Err(WorkflowError::Input(format!(
                    "flow values {:?} cannot be combined",
                    items
                )));
            }
            return Ok(match lowered[0].as_str() {
                "all" => FlowSpec::All,
                "new" => FlowSpec::New,
                _ => FlowSpec::None,
            });
        }
        let mut nums = Vec::with_capacity(items.len());
        for item in items {
            let num: u32 = item
                .parse()
                .map_err(|_| WorkflowError::Input(format!("invalid flow number: '{}'", item)))?;
            if num == 0 {
                return Err(WorkflowError::Input("flow numbers start at 1".into()));
            }
            nums.push(num);
        }
        Ok(FlowSpec::Numbers(nums))
    }
}

/// Allocates flow numbers and records the trigger that started each flow.
#[derive(Debug, Default)]
pub struct FlowManager {
    counter: u32,
    descriptions: HashMap<u32, String>,
}

impl FlowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh flow, recording its origin description.
    pub fn new_flow(&mut self, description: &str) -> u32 {
        self.counter += 1;
        let num = self.counter;
        self.descriptions.insert(num, description.to_string());
        info!(flow = num, description, "new flow started");
        num
    }

    /// Register a known flow number, e.g. from the DB on restart. Only the
    /// first description for a flow is kept.
    pub fn register(&mut self, num: u32, description: Option<&str>) {
        if num > self.counter {
            self.counter = num;
        }
        if let Some(descr) = description {
            if self.descriptions.contains_key(&num) {
                warn!(flow = num, "ignoring duplicate flow description");
            } else {
                self.descriptions.insert(num, descr.to_string());
            }
        }
    }

    /// Register every flow number carried by a restored task instance.
    pub fn register_all(&mut self, nums: &BTreeSet<u32>) {
        for num in nums {
            self.register(*num, None);
        }
    }

    pub fn description(&self, num: u32) -> Option<&str> {
        self.descriptions.get(&num).map(String::as_str)
    }

    /// All flow numbers seen so far, for persistence.
    pub fn descriptions(&self) -> impl Iterator<Item = (u32, &str)> {
        self.descriptions.iter().map(|(n, d)| (*n, d.as_str()))
    }
}

/// Render a flow set the way it appears in logs: `1,2` or `none`.
pub fn format_flow_nums(nums: &BTreeSet<u32>) -> String {
    if nums.is_empty() {
        "none".to_string()
    } else {
        nums.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_spec_parse_keywords() {
        assert_eq!(FlowSpec::parse(&[]).unwrap(), FlowSpec::All);
        assert_eq!(FlowSpec::parse(&["new".into()]).unwrap(), FlowSpec::New);
        assert_eq!(FlowSpec::parse(&["NONE".into()]).unwrap(), FlowSpec::None);
    }

    #[test]
    fn test_flow_spec_parse_numbers() {
        assert_eq!(
            FlowSpec::parse(&["1".into(), "3".into()]).unwrap(),
            FlowSpec::Numbers(vec![1, 3])
        );
    }

    #[test]
    fn test_flow_spec_rejects_mixed() {
        assert!(FlowSpec::parse(&["ALL".into(), "1".into()]).is_err());
        assert!(FlowSpec::parse(&["0".into()]).is_err());
        assert!(FlowSpec::parse(&["x".into()]).is_err());
    }

    #[test]
    fn test_flow_manager_allocates_monotonically() {
        let mut mgr = FlowManager::new();
        assert_eq!(mgr.new_flow("first"), 1);
        assert_eq!(mgr.new_flow("second"), 2);
        assert_eq!(mgr.description(1), Some("first"));
    }

    #[test]
    fn test_flow_manager_restart_counter() {
        let mut mgr = FlowManager::new();
        mgr.register(7, Some("restored"));
        assert_eq!(mgr.new_flow("next"), 8);
    }

    #[test]
    fn test_flow_manager_keeps_first_description() {
        let mut mgr = FlowManager::new();
        mgr.register(1, Some("original"));
        mgr.register(1, Some("duplicate"));
        assert_eq!(mgr.description(1), Some("original"));
    }

    #[test]
    fn test_format_flow_nums() {
        let nums: BTreeSet<u32> = [2, 1].into_iter().collect();
        assert_eq!(format_flow_nums(&nums), "1,2");
        assert_eq!(format_flow_nums(&BTreeSet::new()), "none");
    }
}
