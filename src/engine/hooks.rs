//! Hook Registry
//!
//! Typed publish/subscribe for lifecycle events. Handlers are kept in
//! priority order from the moment they register, so dispatch is a plain walk
//! over the list. Each handler runs under its own timeout; a failing handler
//! either stops the walk or is skipped, per call.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::HookConfig;
use crate::error::{Result, TradeflowError};
use crate::orders::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HookKind {
    FlowStarted,
    NodeCompleted,
    NodeFailed,
    FlowCompleted,
    FlowFailed,
    OutputLogged,
    OrderStatusChanged,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HookEvent {
    FlowStarted {
        flow_id: String,
        execution_id: String,
    },
    NodeCompleted {
        flow_id: String,
        execution_id: String,
        node_id: String,
        result: Value,
    },
    NodeFailed {
        flow_id: String,
        execution_id: String,
        node_id: String,
        error: String,
    },
    FlowCompleted {
        flow_id: String,
        execution_id: String,
        duration_ms: u64,
    },
    FlowFailed {
        flow_id: String,
        execution_id: String,
        error: String,
    },
    OutputLogged {
        flow_id: String,
        node_id: String,
        value: Value,
    },
    OrderStatusChanged {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            HookEvent::FlowStarted { .. } => HookKind::FlowStarted,
            HookEvent::NodeCompleted { .. } => HookKind::NodeCompleted,
            HookEvent::NodeFailed { .. } => HookKind::NodeFailed,
            HookEvent::FlowCompleted { .. } => HookKind::FlowCompleted,
            HookEvent::FlowFailed { .. } => HookKind::FlowFailed,
            HookEvent::OutputLogged { .. } => HookKind::OutputLogged,
            HookEvent::OrderStatusChanged { .. } => HookKind::OrderStatusChanged,
        }
    }
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: &HookEvent) -> Result<()>;
}

/// Adapter for synchronous closures
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(&HookEvent) -> Result<()> + Send + Sync,
{
    async fn handle(&self, event: &HookEvent) -> Result<()> {
        (self.0)(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Registration {
    id: HookId,
    name: String,
    priority: i32,
    handler: Arc<dyn HookHandler>,
}

/// Per-dispatch behaviour
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub continue_on_error: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub invoked: usize,
    /// `(handler name, error)` for every handler that failed or timed out
    pub failures: Vec<(String, String)>,
    /// Dispatch stopped early on a failure
    pub stopped: bool,
}

impl DispatchReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct HookRegistry {
    handlers: RwLock<HashMap<HookKind, Vec<Registration>>>,
    next_id: AtomicU64,
    config: HookConfig,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new(HookConfig::default())
    }
}

impl HookRegistry {
    pub fn new(config: HookConfig) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register a handler. Higher priority runs first; equal priorities run
    /// in registration order.
    pub async fn register(
        &self,
        kind: HookKind,
        name: &str,
        priority: i32,
        handler: Arc<dyn HookHandler>,
    ) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().await;
        let list = handlers.entry(kind).or_default();
        let pos = list
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(list.len());
        list.insert(
            pos,
            Registration {
                id,
                name: name.to_string(),
                priority,
                handler,
            },
        );
        debug!(?kind, name, priority, "Registered hook handler");
        id
    }

    pub async fn unregister(&self, id: HookId) -> bool {
        let mut handlers = self.handlers.write().await;
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub async fn handler_count(&self, kind: HookKind) -> usize {
        self.handlers
            .read()
            .await
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn default_options(&self) -> DispatchOptions {
        DispatchOptions {
            continue_on_error: self.config.continue_on_error,
            timeout: Duration::from_millis(self.config.handler_timeout_ms),
        }
    }

    /// Dispatch with the configured defaults
    pub async fn emit(&self, event: &HookEvent) -> DispatchReport {
        self.emit_with(event, self.default_options()).await
    }

    pub async fn emit_with(&self, event: &HookEvent, options: DispatchOptions) -> DispatchReport {
        // Snapshot the list so handlers may (un)register without deadlocking.
        let targets: Vec<(String, Arc<dyn HookHandler>)> = {
            let handlers = self.handlers.read().await;
            match handlers.get(&event.kind()) {
                Some(list) => list
                    .iter()
                    .map(|r| (r.name.clone(), r.handler.clone()))
                    .collect(),
                None => return DispatchReport::default(),
            }
        };

        let mut report = DispatchReport::default();
        for (name, handler) in targets {
            report.invoked += 1;
            let outcome = match tokio::time::timeout(options.timeout, handler.handle(event)).await {
                Ok(result) => result,
                Err(_) => Err(TradeflowError::Timeout(format!(
                    "hook '{}' exceeded {}ms",
                    name,
                    options.timeout.as_millis()
                ))),
            };

            if let Err(e) = outcome {
                warn!(hook = %name, kind = ?event.kind(), error = %e, "Hook handler failed");
                report.failures.push((name, e.to_string()));
                if !options.continue_on_error {
                    report.stopped = true;
                    break;
                }
            }
        }
        report
    }
}
