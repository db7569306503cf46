//! Runtime Engine
//!
//! Ties the pieces together: active orders get a scheduled task that runs
//! their flow through the task manager and folds the result back into the
//! order. Order status changes are forwarded to the hook registry.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::scheduler::{job, ScheduleOptions, ScheduledFn, Scheduler, SchedulerStats};
use super::task_manager::{TaskManager, TaskOptions, TaskStats};
use crate::config::AppConfig;
use crate::engine::{ExecutionResult, FlowEngine, HookEvent, HookRegistry, PluginContext, PluginRegistry};
use crate::error::{Result, TradeflowError};
use crate::flow::{Flow, FlowStore};
use crate::orders::{CompileOptions, Order, OrderFilter, OrderParams, OrderStatus, OrderTemplates, OrderType};
use crate::plugins::{PaperMarket, PaperPlugin};

/// Explicitly constructed shared state, handed to every component
pub struct OrchestratorContext {
    pub config: AppConfig,
    pub flows: Arc<FlowStore>,
    pub orders: Arc<OrderTemplates>,
    pub plugins: Arc<PluginRegistry>,
    pub hooks: Arc<HookRegistry>,
}

impl OrchestratorContext {
    pub fn new(config: AppConfig) -> Self {
        let flows = Arc::new(FlowStore::new());
        let options = CompileOptions {
            orders: config.orders.clone(),
            max_execution_time_ms: config.engine.default_max_execution_time_ms,
        };
        Self {
            orders: Arc::new(OrderTemplates::new(flows.clone(), options)),
            flows,
            plugins: Arc::new(PluginRegistry::new()),
            hooks: Arc::new(HookRegistry::new(config.hooks.clone())),
            config,
        }
    }

    /// Register the paper plugin and return its market handle
    pub fn register_builtin_plugins(&self) -> PaperMarket {
        let paper = PaperPlugin::new(&self.config.paper);
        let market = paper.market();
        self.plugins.register(Box::new(paper));
        market
    }

    pub fn plugin_context(&self) -> PluginContext {
        PluginContext {
            settings: serde_json::to_value(&self.config.plugins).unwrap_or(Value::Null),
            hooks: self.hooks.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub scheduler: SchedulerStats,
    pub tasks: TaskStats,
    pub flows: usize,
    pub orders: usize,
    pub active_orders: usize,
    pub plugins: Vec<String>,
}

pub struct RuntimeEngine {
    ctx: Arc<OrchestratorContext>,
    engine: Arc<FlowEngine>,
    scheduler: Scheduler,
    tasks: TaskManager,
    /// order id -> scheduled task id
    order_schedules: Arc<DashMap<String, String>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

/// Run a flow as a managed task and hand back its execution result
async fn dispatch(
    tasks: &TaskManager,
    engine: Arc<FlowEngine>,
    flow: Flow,
    input: Option<Value>,
) -> Result<ExecutionResult> {
    let options = TaskOptions::named(&format!("flow:{}", flow.id));
    let value = tasks
        .run(
            async move {
                let result = engine.execute(&flow, input).await;
                anyhow::Ok(serde_json::to_value(result)?)
            },
            options,
        )
        .await?;
    Ok(serde_json::from_value(value)?)
}

/// Execute an order's flow once and apply the outcome to the order.
/// Only active orders run; anything else is refused before the flow can
/// reach its swap.
async fn run_order(
    orders: &OrderTemplates,
    flows: &FlowStore,
    tasks: &TaskManager,
    engine: Arc<FlowEngine>,
    order_id: &str,
) -> Result<(OrderStatus, ExecutionResult)> {
    let order = orders
        .get(order_id)
        .ok_or_else(|| TradeflowError::NotFound(format!("order {}", order_id)))?;
    if order.status != OrderStatus::Active {
        return Err(TradeflowError::InvalidStateTransition {
            from: order.status.to_string(),
            to: OrderStatus::Triggered.to_string(),
        });
    }
    let flow = flows
        .get(&order.flow_id)
        .ok_or_else(|| TradeflowError::NotFound(format!("flow {} of order {}", order.flow_id, order_id)))?;

    let result = dispatch(tasks, engine, flow, None).await?;
    let status = orders.apply_execution(order_id, &result)?;
    debug!(order_id, execution_id = %result.execution_id, %status, "Order check finished");
    Ok((status, result))
}

impl RuntimeEngine {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        let engine = FlowEngine::new(ctx.plugins.clone(), ctx.hooks.clone(), ctx.config.engine.clone());
        Self {
            tasks: TaskManager::new(ctx.config.tasks.clone()),
            engine: Arc::new(engine),
            scheduler: Scheduler::new(),
            order_schedules: Arc::new(DashMap::new()),
            forwarder: Mutex::new(None),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.ctx.hooks
    }

    /// Bind plugins, start forwarding order events and arm a schedule for
    /// every active order. Returns the number of orders scheduled.
    pub async fn start(&self) -> Result<usize> {
        let bound = self.ctx.plugins.bind_all(&self.ctx.plugin_context())?;
        debug!(bound, "Plugins bound");

        {
            let mut forwarder = self.forwarder.lock().unwrap_or_else(|e| e.into_inner());
            if forwarder.is_none() {
                *forwarder = Some(self.spawn_forwarder());
            }
        }
        self.scheduler.start();

        let active = self.ctx.orders.list(&OrderFilter {
            status: Some(OrderStatus::Active),
            ..OrderFilter::default()
        });
        let mut scheduled = 0;
        for order in &active {
            match self.ensure_scheduled(order) {
                Ok(()) => scheduled += 1,
                Err(e) => error!(order_id = %order.id, error = %e, "Failed to schedule order"),
            }
        }
        info!(scheduled, plugins = ?self.ctx.plugins.names(), "Runtime started");
        Ok(scheduled)
    }

    /// Disarm every timer, then wait for in-flight executions
    pub async fn stop(&self) {
        self.scheduler.stop();
        self.tasks.wait_all().await;
        if let Some(handle) = self.forwarder.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        info!("Runtime stopped");
    }

    fn spawn_forwarder(&self) -> JoinHandle<()> {
        let mut rx = self.ctx.orders.subscribe();
        let hooks = self.ctx.hooks.clone();
        let scheduler = self.scheduler.clone();
        let schedules = self.order_schedules.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if change.to.is_terminal() {
                            if let Some((_, task_id)) = schedules.remove(&change.order_id) {
                                scheduler.remove(&task_id);
                                debug!(order_id = %change.order_id, "Order schedule removed");
                            }
                        }
                        hooks
                            .emit(&HookEvent::OrderStatusChanged {
                                order_id: change.order_id,
                                from: change.from,
                                to: change.to,
                            })
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Order event forwarder lagged {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn order_job(&self, order_id: &str) -> ScheduledFn {
        let orders = self.ctx.orders.clone();
        let flows = self.ctx.flows.clone();
        let tasks = self.tasks.clone();
        let engine = self.engine.clone();
        let order_id = order_id.to_string();

        job(move || {
            let orders = orders.clone();
            let flows = flows.clone();
            let tasks = tasks.clone();
            let engine = engine.clone();
            let order_id = order_id.clone();
            async move {
                let (status, result) = match run_order(&orders, &flows, &tasks, engine, &order_id).await {
                    Ok(outcome) => outcome,
                    Err(TradeflowError::InvalidStateTransition { from, .. }) => {
                        debug!(order_id = %order_id, status = %from, "Skipping check for inactive order");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                if status == OrderStatus::Failed {
                    anyhow::bail!(
                        "order {} failed: {}",
                        order_id,
                        result.error.unwrap_or_else(|| "unknown error".to_string())
                    );
                }
                Ok(())
            }
        })
    }

    /// Register (or re-enable) the order's schedule
    fn ensure_scheduled(&self, order: &Order) -> Result<()> {
        let existing = self.order_schedules.get(&order.id).map(|e| e.value().clone());
        if let Some(task_id) = existing {
            if self.scheduler.enable(&task_id) {
                return Ok(());
            }
            self.order_schedules.remove(&order.id);
        }

        let flow = self
            .ctx
            .flows
            .get(&order.flow_id)
            .ok_or_else(|| TradeflowError::NotFound(format!("flow {}", order.flow_id)))?;
        let timing = flow
            .schedule()
            .ok_or_else(|| TradeflowError::Validation(format!("flow {} has no schedule trigger", flow.id)))?;

        let options = ScheduleOptions {
            name: Some(format!("order:{}", order.id)),
            // Price watchers check once right away; cron cadences wait for their slot.
            immediate: timing.interval.is_some(),
            interval: timing.interval,
            cron: timing.cron,
            run_once: false,
        };
        let task = self.scheduler.schedule(self.order_job(&order.id), options)?;
        info!(order_id = %order.id, schedule_id = %task.id, "Order scheduled");
        self.order_schedules.insert(order.id.clone(), task.id);
        Ok(())
    }

    /// Create an order, optionally activating it straight away
    pub fn create_order(&self, order_type: OrderType, params: OrderParams, activate: bool) -> Result<Order> {
        let (order, _) = self.ctx.orders.create(order_type, params)?;
        if activate && !self.activate_order(&order.id)? {
            return Err(TradeflowError::InvalidStateTransition {
                from: order.status.to_string(),
                to: OrderStatus::Active.to_string(),
            });
        }
        Ok(self.ctx.orders.get(&order.id).unwrap_or(order))
    }

    /// Activate (or resume) an order and arm its schedule. `Ok(false)` when
    /// the lifecycle refuses the transition.
    pub fn activate_order(&self, id: &str) -> Result<bool> {
        if !self.ctx.orders.activate(id) {
            return Ok(false);
        }
        let order = self
            .ctx
            .orders
            .get(id)
            .ok_or_else(|| TradeflowError::NotFound(format!("order {}", id)))?;
        if let Err(e) = self.ensure_scheduled(&order) {
            self.ctx.orders.update_status(id, OrderStatus::Failed, Some(e.to_string()));
            return Err(e);
        }
        Ok(true)
    }

    pub fn pause_order(&self, id: &str) -> bool {
        if !self.ctx.orders.pause(id) {
            return false;
        }
        if let Some(task_id) = self.order_schedules.get(id).map(|e| e.value().clone()) {
            self.scheduler.disable(&task_id);
        }
        true
    }

    pub fn cancel_order(&self, id: &str) -> bool {
        if !self.ctx.orders.cancel(id) {
            return false;
        }
        if let Some((_, task_id)) = self.order_schedules.remove(id) {
            self.scheduler.remove(&task_id);
        }
        true
    }

    /// Manually trigger a flow through the task manager
    pub async fn execute_flow(&self, flow_id: &str, input: Option<Value>) -> Result<ExecutionResult> {
        let flow = self
            .ctx
            .flows
            .get(flow_id)
            .ok_or_else(|| TradeflowError::NotFound(format!("flow {}", flow_id)))?;
        dispatch(&self.tasks, self.engine.clone(), flow, input).await
    }

    /// Check an active order now, outside its cadence. Other statuses are
    /// refused with `InvalidStateTransition`.
    pub async fn run_order_now(&self, id: &str) -> Result<(OrderStatus, ExecutionResult)> {
        run_order(&self.ctx.orders, &self.ctx.flows, &self.tasks, self.engine.clone(), id).await
    }

    pub fn schedule_for(&self, order_id: &str) -> Option<String> {
        self.order_schedules.get(order_id).map(|e| e.value().clone())
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            scheduler: self.scheduler.stats(),
            tasks: self.tasks.stats(),
            flows: self.ctx.flows.len(),
            orders: self.ctx.orders.len(),
            active_orders: self
                .ctx
                .orders
                .list(&OrderFilter {
                    status: Some(OrderStatus::Active),
                    ..OrderFilter::default()
                })
                .len(),
            plugins: self.ctx.plugins.names(),
        }
    }
}
