pub mod cli;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod orders;
pub mod persistence;
pub mod plugins;
pub mod runtime;

pub use condition::{Condition, ConditionEvaluator, ConditionGroup, ConditionItem, EvaluationResult};
pub use config::AppConfig;
pub use engine::{
    ActionExecutor, ActionResult, ExecutionResult, ExecutionStatus, FlowEngine, HookEvent, HookKind,
    HookRegistry, PluginRegistry,
};
pub use error::{Result, TradeflowError};
pub use flow::{Flow, FlowDraft, FlowStore, ValidationReport};
pub use orders::{Order, OrderParams, OrderStatus, OrderTemplates, OrderType};
pub use plugins::{PaperMarket, PaperPlugin};
pub use runtime::{OrchestratorContext, RuntimeEngine, Scheduler, TaskManager};
