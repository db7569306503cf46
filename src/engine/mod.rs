//! Flow execution: the graph interpreter, the plugin boundary it calls
//! through, and the lifecycle hook registry.

mod flow_engine;
pub mod hooks;
pub mod plugins;

pub use flow_engine::{ExecutionErrorKind, ExecutionResult, ExecutionStatus, FlowEngine};
pub use hooks::{DispatchOptions, DispatchReport, FnHook, HookEvent, HookHandler, HookId, HookKind, HookRegistry};
pub use plugins::{ActionExecutor, ActionResult, BoundPlugin, Plugin, PluginContext, PluginRegistry, PluginState};
