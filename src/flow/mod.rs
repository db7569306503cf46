//! Flow Model
//!
//! Directed workflow graphs, their structural validation, the built-in
//! templates and the in-process flow registry.

pub mod model;
mod store;
mod templates;
mod validation;

pub use model::{
    ActionData, ActionKind, ConditionData, Edge, EdgeType, Flow, FlowDraft, FlowSettings, LogLevel, Node,
    NodeData, NodeType, OutputData, OutputType, TriggerConfig, TriggerData, TriggerType, Variable,
    VariableType, HANDLE_ERROR, HANDLE_FALSE, HANDLE_OUTPUT, HANDLE_TRUE,
};
pub use store::{FlowStore, FlowUpdate};
pub use templates::{template, templates, FlowTemplate};
pub use validation::{validate, ValidationReport};
