//! Flow Store
//!
//! Owns every flow in the orchestrator context. Executions get a cloned
//! snapshot, so later updates never affect a run in progress.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::model::{Edge, Flow, FlowDraft, FlowSettings, Node, Variable};
use super::templates;
use super::validation::{validate, ValidationReport};
use crate::error::{Result, TradeflowError};

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub nodes: Option<Vec<Node>>,
    pub edges: Option<Vec<Edge>>,
    pub variables: Option<Vec<Variable>>,
    pub settings: Option<FlowSettings>,
}

#[derive(Default)]
pub struct FlowStore {
    flows: DashMap<String, Flow>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new flow with a fresh id
    pub fn create(&self, draft: FlowDraft) -> Flow {
        let flow = draft.build();
        debug!(flow_id = %flow.id, name = %flow.name, "Created flow");
        self.flows.insert(flow.id.clone(), flow.clone());
        flow
    }

    /// Insert a flow as-is, keeping its id (used when restoring state)
    pub fn insert(&self, flow: Flow) {
        self.flows.insert(flow.id.clone(), flow);
    }

    pub fn get(&self, id: &str) -> Option<Flow> {
        self.flows.get(id).map(|f| f.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.flows.contains_key(id)
    }

    pub fn update(&self, id: &str, update: FlowUpdate) -> Result<Flow> {
        let mut entry = self
            .flows
            .get_mut(id)
            .ok_or_else(|| TradeflowError::NotFound(format!("flow {}", id)))?;
        let flow = entry.value_mut();

        if let Some(name) = update.name {
            flow.name = name;
        }
        if let Some(description) = update.description {
            flow.description = Some(description);
        }
        if let Some(nodes) = update.nodes {
            flow.nodes = nodes;
        }
        if let Some(edges) = update.edges {
            flow.edges = edges;
        }
        if let Some(variables) = update.variables {
            flow.variables = variables;
        }
        if let Some(settings) = update.settings {
            flow.settings = settings;
        }
        flow.version += 1;
        flow.updated_at = Utc::now();

        debug!(flow_id = %id, version = flow.version, "Updated flow");
        Ok(flow.clone())
    }

    pub fn delete(&self, id: &str) -> bool {
        self.flows.remove(id).is_some()
    }

    /// All flows, newest first
    pub fn list(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.flows.iter().map(|f| f.value().clone()).collect();
        flows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn validate(&self, id: &str) -> Result<ValidationReport> {
        let flow = self
            .get(id)
            .ok_or_else(|| TradeflowError::NotFound(format!("flow {}", id)))?;
        Ok(validate(&flow))
    }

    /// Serialize a flow to its JSON transport document
    pub fn export(&self, id: &str) -> Result<String> {
        let flow = self
            .get(id)
            .ok_or_else(|| TradeflowError::NotFound(format!("flow {}", id)))?;
        Ok(serde_json::to_string_pretty(&flow)?)
    }

    /// Register a flow from a JSON document. Id, version and timestamps are
    /// regenerated; the graph, variables and settings are kept verbatim.
    pub fn import(&self, json: &str) -> Result<Flow> {
        let draft: FlowDraft = serde_json::from_str(json)
            .map_err(|e| TradeflowError::Validation(format!("invalid flow document: {}", e)))?;
        let flow = self.create(draft);
        info!(flow_id = %flow.id, nodes = flow.nodes.len(), "Imported flow");
        Ok(flow)
    }

    /// Instantiate a built-in template; every call yields a new flow id
    pub fn create_from_template(&self, template_id: &str) -> Result<Flow> {
        let template = templates::template(template_id)
            .ok_or_else(|| TradeflowError::NotFound(format!("template {}", template_id)))?;
        Ok(self.create(template.draft()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_from_template_twice() {
        let store = FlowStore::new();
        let a = store.create_from_template("conditional").unwrap();
        let b = store.create_from_template("conditional").unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.nodes, b.nodes);
        assert_eq!(a.edges, b.edges);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_unknown_template() {
        let store = FlowStore::new();
        assert!(matches!(
            store.create_from_template("missing"),
            Err(TradeflowError::NotFound(_))
        ));
    }

    #[test]
    fn test_export_import_preserves_graph() {
        let store = FlowStore::new();
        let original = store.create_from_template("error-handling").unwrap();

        let json = store.export(&original.id).unwrap();
        let imported = store.import(&json).unwrap();

        assert_ne!(imported.id, original.id);
        assert_eq!(imported.nodes, original.nodes);
        assert_eq!(imported.edges, original.edges);
        assert_eq!(imported.variables, original.variables);
        assert_eq!(imported.settings, original.settings);
    }

    #[test]
    fn test_import_rejects_garbage() {
        let store = FlowStore::new();
        assert!(matches!(store.import("{ not json"), Err(TradeflowError::Validation(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_bumps_version() {
        let store = FlowStore::new();
        let flow = store.create_from_template("simple-action").unwrap();

        let updated = store
            .update(
                &flow.id,
                FlowUpdate {
                    name: Some("Renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.version, 2);
        assert_eq!(updated.nodes, flow.nodes);

        assert!(store.delete(&flow.id));
        assert!(!store.delete(&flow.id));
        assert!(store.update(&flow.id, FlowUpdate::default()).is_err());
    }
}
