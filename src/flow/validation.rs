//! Structural validation of flow graphs
//!
//! Advisory when authoring, mandatory before execution.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::model::{Flow, NodeData, NodeType, HANDLE_ERROR, HANDLE_FALSE, HANDLE_OUTPUT, HANDLE_TRUE};
use crate::error::{Result, TradeflowError};

/// Outcome of validating a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// `InvalidFlow` carrying every error when the flow did not validate
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(TradeflowError::InvalidFlow { errors: self.errors })
        }
    }
}

/// Validate a flow against the graph invariants: exactly one trigger with no
/// incoming edges, true/false handles on conditions, at most one
/// output and one error edge per action, no cycles, everything reachable.
pub fn validate(flow: &Flow) -> ValidationReport {
    let mut errors = Vec::new();

    let mut node_ids: HashSet<&str> = HashSet::new();
    for node in &flow.nodes {
        if node.id.is_empty() {
            errors.push(format!("Node '{}' has an empty id", node.name));
        } else if !node_ids.insert(node.id.as_str()) {
            errors.push(format!("Duplicate node id '{}'", node.id));
        }
    }

    let mut edge_ids: HashSet<&str> = HashSet::new();
    let mut dangling = false;
    for edge in &flow.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            errors.push(format!("Duplicate edge id '{}'", edge.id));
        }
        if !node_ids.contains(edge.source.as_str()) {
            errors.push(format!("Edge '{}' references unknown source node '{}'", edge.id, edge.source));
            dangling = true;
        }
        if !node_ids.contains(edge.target.as_str()) {
            errors.push(format!("Edge '{}' references unknown target node '{}'", edge.id, edge.target));
            dangling = true;
        }
    }

    let triggers: Vec<&str> = flow.triggers().map(|n| n.id.as_str()).collect();
    match triggers.len() {
        0 => errors.push("Flow must have a trigger node".to_string()),
        1 => {}
        n => errors.push(format!("Flow must have exactly one trigger node, found {}", n)),
    }

    for node in &flow.nodes {
        let outgoing: Vec<_> = flow.outgoing(&node.id).collect();
        match &node.data {
            NodeData::Trigger(_) => {
                if flow.incoming(&node.id).next().is_some() {
                    errors.push(format!("Trigger node '{}' must not have incoming edges", node.id));
                }
            }
            NodeData::Condition(data) => {
                if data.conditions.is_empty() {
                    errors.push(format!("Condition node '{}' has no conditions", node.id));
                }
                let count = |handle: &str| {
                    outgoing
                        .iter()
                        .filter(|e| e.source_handle.as_deref() == Some(handle))
                        .count()
                };
                if outgoing.len() != 2 || count(HANDLE_TRUE) != 1 || count(HANDLE_FALSE) != 1 {
                    errors.push(format!(
                        "Condition node '{}' must have exactly two outgoing edges, one 'true' and one 'false'",
                        node.id
                    ));
                }
            }
            NodeData::Action(data) => {
                if data.plugin_name.is_empty() || data.action_name.is_empty() {
                    errors.push(format!("Action node '{}' must name a plugin and an action", node.id));
                }
                let mut outputs = 0;
                let mut failures = 0;
                for edge in &outgoing {
                    match edge.action_handle() {
                        HANDLE_OUTPUT => outputs += 1,
                        HANDLE_ERROR => failures += 1,
                        other => errors.push(format!(
                            "Action node '{}' has edge '{}' with unknown handle '{}'",
                            node.id, edge.id, other
                        )),
                    }
                }
                if outputs > 1 {
                    errors.push(format!("Action node '{}' has more than one output edge", node.id));
                }
                if failures > 1 {
                    errors.push(format!("Action node '{}' has more than one error edge", node.id));
                }
            }
            NodeData::Output(_) => {}
        }
    }

    // The graph checks below assume every edge endpoint exists.
    if dangling {
        return ValidationReport::from_errors(errors);
    }

    let cyclic = cyclic_nodes(flow);
    if !cyclic.is_empty() {
        errors.push(format!("Flow contains a cycle involving nodes: {}", cyclic.join(", ")));
    }

    if let [trigger] = triggers.as_slice() {
        let reachable = reachable_from(flow, trigger);
        for node in &flow.nodes {
            if !reachable.contains(node.id.as_str()) && node.node_type() != NodeType::Trigger {
                errors.push(format!("Node '{}' is not reachable from the trigger", node.id));
            }
        }
    }

    ValidationReport::from_errors(errors)
}

/// Nodes whose predecessors never all resolve (Kahn's algorithm leftovers)
fn cyclic_nodes(flow: &Flow) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = flow.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for edge in &flow.edges {
        if let Some(d) = in_degree.get_mut(edge.target.as_str()) {
            *d += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut resolved = 0;

    while let Some(id) = queue.pop_front() {
        resolved += 1;
        for edge in flow.outgoing(id) {
            if let Some(d) = in_degree.get_mut(edge.target.as_str()) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
    }

    if resolved == in_degree.len() {
        return Vec::new();
    }
    let mut left: Vec<String> = in_degree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id.to_string())
        .collect();
    left.sort();
    left
}

fn reachable_from<'a>(flow: &'a Flow, start: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for edge in flow.outgoing(id) {
            if seen.insert(edge.target.as_str()) {
                queue.push_back(edge.target.as_str());
            }
        }
    }
    seen
}
