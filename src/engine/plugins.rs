//! Plugin boundary
//!
//! `ActionExecutor` is what the flow engine calls. `PluginRegistry` is the
//! standard implementation: it resolves `plugin:action` names to bound
//! plugins. A plugin only gains its action/provider operations once it has
//! been bound to the orchestrator context, so calling them early is a type
//! error rather than a runtime null check.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::hooks::HookRegistry;
use crate::error::{Result, TradeflowError};

/// `{success, data?, error?}` envelope returned by actions and providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Collaborator the flow engine dispatches action and provider nodes to.
///
/// `Ok(ActionResult { success: false, .. })` is a business failure and is
/// routed through the flow's error edge. `Err` means the call itself broke
/// and is eligible for node retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute_action(&self, name: &str, input: Value) -> Result<ActionResult>;

    async fn get_data(&self, name: &str, query: Value) -> Result<ActionResult>;
}

/// What a plugin receives when it is bound
#[derive(Clone)]
pub struct PluginContext {
    /// Per-plugin settings keyed by plugin name
    pub settings: Value,
    pub hooks: Arc<HookRegistry>,
}

impl PluginContext {
    pub fn settings_for(&self, plugin: &str) -> &Value {
        self.settings.get(plugin).unwrap_or(&Value::Null)
    }
}

/// A plugin before it has been attached to the orchestrator
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn bind(&self, ctx: &PluginContext) -> Result<Arc<dyn BoundPlugin>>;
}

/// A plugin attached to the orchestrator, able to serve calls
#[async_trait]
pub trait BoundPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn actions(&self) -> Vec<String>;

    fn providers(&self) -> Vec<String>;

    async fn execute_action(&self, action: &str, input: Value) -> Result<ActionResult>;

    async fn get_data(&self, provider: &str, query: Value) -> Result<ActionResult>;
}

pub enum PluginState {
    Uninitialized(Box<dyn Plugin>),
    Bound(Arc<dyn BoundPlugin>),
}

impl PluginState {
    pub fn is_bound(&self) -> bool {
        matches!(self, PluginState::Bound(_))
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<BTreeMap<String, PluginState>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, PluginState>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PluginState>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a plugin; it stays dormant until `bind_all`
    pub fn register(&self, plugin: Box<dyn Plugin>) {
        let name = plugin.name().to_string();
        debug!(plugin = %name, "Registered plugin");
        self.write().insert(name, PluginState::Uninitialized(plugin));
    }

    /// Bind every uninitialized plugin to the context. Stops at the first
    /// plugin that refuses to bind; already bound plugins are untouched.
    pub fn bind_all(&self, ctx: &PluginContext) -> Result<usize> {
        let mut plugins = self.write();
        let mut bound = 0;
        for (name, state) in plugins.iter_mut() {
            if let PluginState::Uninitialized(plugin) = state {
                let ready = plugin.bind(ctx)?;
                *state = PluginState::Bound(ready);
                bound += 1;
                info!(plugin = %name, "Plugin bound");
            }
        }
        Ok(bound)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.read().get(name).map(PluginState::is_bound).unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Resolve `plugin:action`, or a bare action name served by any bound plugin
    fn resolve(&self, name: &str, provider: bool) -> Result<Option<(Arc<dyn BoundPlugin>, String)>> {
        let plugins = self.read();

        if let Some((plugin_name, op)) = name.split_once(':') {
            return match plugins.get(plugin_name) {
                Some(PluginState::Bound(p)) => Ok(Some((p.clone(), op.to_string()))),
                Some(PluginState::Uninitialized(_)) => {
                    Err(TradeflowError::PluginNotInitialized(plugin_name.to_string()))
                }
                None => Ok(None),
            };
        }

        let found = plugins.values().find_map(|state| match state {
            PluginState::Bound(p) => {
                let ops = if provider { p.providers() } else { p.actions() };
                ops.iter().any(|o| o == name).then(|| p.clone())
            }
            PluginState::Uninitialized(_) => None,
        });
        Ok(found.map(|p| (p, name.to_string())))
    }
}

/// Plugin errors become `success: false` here, except transient ones which
/// propagate so the engine can retry the node.
fn settle(name: &str, outcome: Result<ActionResult>) -> Result<ActionResult> {
    match outcome {
        Ok(result) => Ok(result),
        Err(e) if e.is_transient() => Err(e),
        Err(e) => {
            warn!(action = %name, error = %e, "Plugin call failed");
            Ok(ActionResult::fail(e.to_string()))
        }
    }
}

#[async_trait]
impl ActionExecutor for PluginRegistry {
    async fn execute_action(&self, name: &str, input: Value) -> Result<ActionResult> {
        match self.resolve(name, false)? {
            Some((plugin, action)) => settle(name, plugin.execute_action(&action, input).await),
            None => Ok(ActionResult::fail(format!("Unknown action: {}", name))),
        }
    }

    async fn get_data(&self, name: &str, query: Value) -> Result<ActionResult> {
        match self.resolve(name, true)? {
            Some((plugin, provider)) => settle(name, plugin.get_data(&provider, query).await),
            None => Ok(ActionResult::fail(format!("Unknown provider: {}", name))),
        }
    }
}
