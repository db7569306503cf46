//! Flow graph data model
//!
//! The serialized shape (camelCase field names, `type`/`data` node payloads)
//! is the transport format used by export/import and the state file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::condition::{ConditionGroup, ConditionItem, LogicalOperator};

pub const HANDLE_TRUE: &str = "true";
pub const HANDLE_FALSE: &str = "false";
pub const HANDLE_OUTPUT: &str = "output";
pub const HANDLE_ERROR: &str = "error";

/// Node type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Trigger,
    Action,
    Condition,
    Output,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Trigger => write!(f, "trigger"),
            NodeType::Action => write!(f, "action"),
            NodeType::Condition => write!(f, "condition"),
            NodeType::Output => write!(f, "output"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Manual,
    Schedule,
}

/// Timing for schedule triggers; interval is in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub config: TriggerConfig,
}

impl TriggerData {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn cron(expr: &str) -> Self {
        Self {
            trigger_type: TriggerType::Schedule,
            config: TriggerConfig {
                cron: Some(expr.to_string()),
                interval: None,
            },
        }
    }

    pub fn interval(ms: u64) -> Self {
        Self {
            trigger_type: TriggerType::Schedule,
            config: TriggerConfig {
                cron: None,
                interval: Some(ms),
            },
        }
    }
}

/// Which collaborator an action node is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Action,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionData {
    pub plugin_name: String,
    pub action_name: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default)]
    pub kind: ActionKind,
}

impl ActionData {
    /// `plugin:action` name used by the execution collaborator
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.plugin_name, self.action_name)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionData {
    #[serde(default)]
    pub operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<ConditionItem>,
}

impl ConditionData {
    pub fn group(&self) -> ConditionGroup {
        ConditionGroup::new(self.operator, self.conditions.clone())
    }
}

impl From<ConditionGroup> for ConditionData {
    fn from(group: ConditionGroup) -> Self {
        Self {
            operator: group.operator,
            conditions: group.conditions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    Return,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OutputData {
    pub output_type: OutputType,
    #[serde(default = "empty_object")]
    pub config: Value,
}

/// Type-specific node payload
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Trigger(TriggerData),
    Action(ActionData),
    Condition(ConditionData),
    Output(OutputData),
}

impl NodeData {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeData::Trigger(_) => NodeType::Trigger,
            NodeData::Action(_) => NodeType::Action,
            NodeData::Condition(_) => NodeType::Condition,
            NodeData::Output(_) => NodeType::Output,
        }
    }
}

/// A unit of work within a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub data: NodeData,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data: NodeData) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data,
        }
    }

    pub fn trigger(id: &str, name: &str, data: TriggerData) -> Self {
        Self::new(id, name, NodeData::Trigger(data))
    }

    pub fn action(id: &str, name: &str, plugin: &str, action: &str, params: Value) -> Self {
        Self::new(
            id,
            name,
            NodeData::Action(ActionData {
                plugin_name: plugin.to_string(),
                action_name: action.to_string(),
                params,
                kind: ActionKind::Action,
            }),
        )
    }

    pub fn provider(id: &str, name: &str, plugin: &str, provider: &str, query: Value) -> Self {
        Self::new(
            id,
            name,
            NodeData::Action(ActionData {
                plugin_name: plugin.to_string(),
                action_name: provider.to_string(),
                params: query,
                kind: ActionKind::Provider,
            }),
        )
    }

    pub fn condition(id: &str, name: &str, group: ConditionGroup) -> Self {
        Self::new(id, name, NodeData::Condition(group.into()))
    }

    pub fn output(id: &str, name: &str, output_type: OutputType) -> Self {
        Self::new(
            id,
            name,
            NodeData::Output(OutputData {
                output_type,
                config: empty_object(),
            }),
        )
    }

    pub fn node_type(&self) -> NodeType {
        self.data.node_type()
    }
}

/// Wire form of a node: `{id, type, name, data}`
#[derive(Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    name: String,
    #[serde(default = "empty_object")]
    data: Value,
}

impl TryFrom<RawNode> for Node {
    type Error = serde_json::Error;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let data = match raw.node_type {
            NodeType::Trigger => NodeData::Trigger(serde_json::from_value(raw.data)?),
            NodeType::Action => NodeData::Action(serde_json::from_value(raw.data)?),
            NodeType::Condition => NodeData::Condition(serde_json::from_value(raw.data)?),
            NodeType::Output => NodeData::Output(serde_json::from_value(raw.data)?),
        };
        Ok(Node {
            id: raw.id,
            name: raw.name,
            data,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        let node_type = node.node_type();
        // Serializing these plain structs into a Value cannot fail.
        let data = match node.data {
            NodeData::Trigger(d) => serde_json::to_value(d),
            NodeData::Action(d) => serde_json::to_value(d),
            NodeData::Condition(d) => serde_json::to_value(d),
            NodeData::Output(d) => serde_json::to_value(d),
        }
        .unwrap_or_else(|_| empty_object());
        RawNode {
            id: node.id,
            node_type,
            name: node.name,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Default,
    Success,
    Failure,
}

/// Directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<EdgeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            id: format!("e-{}-{}", source, target),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: None,
            edge_type: None,
            label: None,
        }
    }

    pub fn with_handle(mut self, handle: &str) -> Self {
        self.source_handle = Some(handle.to_string());
        self.edge_type = match handle {
            HANDLE_OUTPUT => Some(EdgeType::Success),
            HANDLE_ERROR => Some(EdgeType::Failure),
            _ => self.edge_type,
        };
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Handle an action node's edge represents: explicit handle first,
    /// then the edge type, defaulting to the success output.
    pub fn action_handle(&self) -> &str {
        match (self.source_handle.as_deref(), self.edge_type) {
            (Some(handle), _) => handle,
            (None, Some(EdgeType::Failure)) => HANDLE_ERROR,
            _ => HANDLE_OUTPUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// Flow-level variable; its default value is visible to every node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSettings {
    /// Wall-clock budget for one execution, in milliseconds
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Check cadence in milliseconds used when the trigger has no timing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_check_interval: Option<u64>,
}

fn default_max_execution_time() -> u64 {
    60_000
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_execution_time: default_max_execution_time(),
            retry_on_failure: false,
            log_level: LogLevel::Info,
            default_check_interval: None,
        }
    }
}

/// Everything about a flow except its identity and timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDraft {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub settings: FlowSettings,
}

impl FlowDraft {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: Vec::new(),
            settings: FlowSettings::default(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Materialize with a fresh id and current timestamps
    pub fn build(self) -> Flow {
        let now = Utc::now();
        Flow {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            description: self.description,
            version: 1,
            nodes: self.nodes,
            edges: self.edges,
            variables: self.variables,
            settings: self.settings,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A named, versioned workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: u32,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub settings: FlowSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.node_type() == NodeType::Trigger)
    }

    pub fn trigger(&self) -> Option<&Node> {
        self.triggers().next()
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Schedule timing from the trigger node, falling back to the flow's
    /// default check interval.
    pub fn schedule(&self) -> Option<TriggerConfig> {
        let trigger = match self.trigger().map(|n| &n.data) {
            Some(NodeData::Trigger(data)) => data,
            _ => return None,
        };
        if trigger.trigger_type != TriggerType::Schedule {
            return None;
        }
        if trigger.config.cron.is_some() || trigger.config.interval.is_some() {
            return Some(trigger.config.clone());
        }
        self.settings.default_check_interval.map(|ms| TriggerConfig {
            cron: None,
            interval: Some(ms),
        })
    }

    pub fn to_draft(&self) -> FlowDraft {
        FlowDraft {
            name: self.name.clone(),
            description: self.description.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            variables: self.variables.clone(),
            settings: self.settings.clone(),
        }
    }
}
