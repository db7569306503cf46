//! Order Templates
//!
//! Creates orders (compiling each to its flow) and owns the order lifecycle.
//! Illegal transitions are refused with `false`, never an error.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::compiler::{self, CompileOptions, NODE_SWAP};
use super::types::{Order, OrderFilter, OrderParams, OrderStatus, OrderStatusChange, OrderType};
use crate::engine::ExecutionResult;
use crate::error::{Result, TradeflowError};
use crate::flow::{Flow, FlowStore};

struct Entry {
    seq: u64,
    order: Order,
}

pub struct OrderTemplates {
    orders: DashMap<String, Entry>,
    flows: Arc<FlowStore>,
    options: CompileOptions,
    seq: AtomicU64,
    event_tx: broadcast::Sender<OrderStatusChange>,
}

impl OrderTemplates {
    pub fn new(flows: Arc<FlowStore>, options: CompileOptions) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            orders: DashMap::new(),
            flows,
            options,
            seq: AtomicU64::new(0),
            event_tx,
        }
    }

    pub fn with_defaults(flows: Arc<FlowStore>) -> Self {
        Self::new(flows, CompileOptions::default())
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> broadcast::Receiver<OrderStatusChange> {
        self.event_tx.subscribe()
    }

    /// Create an order and register its compiled flow
    pub fn create(&self, order_type: OrderType, params: OrderParams) -> Result<(Order, Flow)> {
        self.create_with_id(None, order_type, params)
    }

    /// Like `create` with a caller-chosen id. Reusing an id replaces the
    /// previous order; avoiding that is up to the caller.
    pub fn create_with_id(&self, id: Option<String>, order_type: OrderType, params: OrderParams) -> Result<(Order, Flow)> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let draft = compiler::compile(&id, order_type, &params, &self.options)?;
        let flow = self.flows.create(draft);

        let order = Order {
            id: id.clone(),
            order_type,
            status: OrderStatus::Created,
            params,
            flow_id: flow.id.clone(),
            created_at: Utc::now(),
            triggered_at: None,
            completed_at: None,
            error: None,
            execution_count: 0,
        };
        info!(order_id = %id, order_type = %order_type, flow_id = %flow.id, "Order created");
        self.insert(order.clone());
        Ok((order, flow))
    }

    /// Insert an order as-is (state restore)
    pub fn insert(&self, order: Order) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.orders.insert(order.id.clone(), Entry { seq, order });
    }

    pub fn get(&self, id: &str) -> Option<Order> {
        self.orders.get(id).map(|e| e.order.clone())
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Newest first, filtered, then paginated
    pub fn list(&self, filter: &OrderFilter) -> Vec<Order> {
        let mut matched: Vec<(u64, Order)> = self
            .orders
            .iter()
            .filter(|e| filter.matches(&e.order))
            .map(|e| (e.seq, e.order.clone()))
            .collect();
        matched.sort_by(|(sa, a), (sb, b)| b.created_at.cmp(&a.created_at).then(sb.cmp(sa)));

        matched
            .into_iter()
            .map(|(_, order)| order)
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Move `id` to `to` if the current status allows it
    fn transition(&self, id: &str, to: OrderStatus) -> bool {
        let change = {
            let mut entry = match self.orders.get_mut(id) {
                Some(entry) => entry,
                None => return false,
            };
            let from = entry.order.status;
            if !from.can_transition_to(to) {
                warn!(order_id = %id, %from, %to, "Rejected order transition");
                return false;
            }
            entry.order.status = to;
            OrderStatusChange {
                order_id: id.to_string(),
                from,
                to,
                at: Utc::now(),
            }
        };
        self.publish(change);
        true
    }

    fn publish(&self, change: OrderStatusChange) {
        info!(order_id = %change.order_id, from = %change.from, to = %change.to, "Order status changed");
        let _ = self.event_tx.send(change);
    }

    pub fn activate(&self, id: &str) -> bool {
        self.transition(id, OrderStatus::Active)
    }

    pub fn pause(&self, id: &str) -> bool {
        self.transition(id, OrderStatus::Paused)
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.transition(id, OrderStatus::Cancelled)
    }

    /// Set a status without lifecycle checks, stamping `completed_at`,
    /// `triggered_at` or `error` as appropriate. False for unknown ids.
    pub fn update_status(&self, id: &str, status: OrderStatus, error: Option<String>) -> bool {
        let change = {
            let mut entry = match self.orders.get_mut(id) {
                Some(entry) => entry,
                None => return false,
            };
            let order = &mut entry.order;
            let from = order.status;
            let now = Utc::now();
            order.status = status;
            match status {
                OrderStatus::Completed => order.completed_at = Some(now),
                OrderStatus::Triggered => order.triggered_at = Some(now),
                OrderStatus::Failed => order.error = error.or_else(|| Some("unknown error".to_string())),
                _ => {}
            }
            OrderStatusChange {
                order_id: id.to_string(),
                from,
                to: status,
                at: now,
            }
        };
        if change.from != change.to {
            self.publish(change);
        }
        true
    }

    /// Fold a finished execution of the order's flow into its status.
    ///
    /// A settled swap always counts, even when a later step failed or the
    /// order was paused while the flow ran. Otherwise only active orders
    /// react. Returns the resulting status.
    pub fn apply_execution(&self, id: &str, result: &ExecutionResult) -> Result<OrderStatus> {
        let order = self
            .get(id)
            .ok_or_else(|| TradeflowError::NotFound(format!("order {}", id)))?;
        let swapped = result.succeeded(NODE_SWAP);

        match order.status {
            OrderStatus::Active => {}
            OrderStatus::Paused if swapped => {
                info!(order_id = %id, "Swap settled while the order was paused");
            }
            status => {
                if swapped {
                    warn!(order_id = %id, %status, "Swap settled for an order that is no longer active");
                } else {
                    debug!(order_id = %id, %status, "Ignoring execution for inactive order");
                }
                return Ok(status);
            }
        }

        if !swapped {
            if result.is_success() {
                return Ok(OrderStatus::Active);
            }
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "flow execution failed".to_string());
            self.update_status(id, OrderStatus::Failed, Some(error));
            return Ok(OrderStatus::Failed);
        }

        if let Some(error) = result.error.as_deref().filter(|_| !result.is_success()) {
            warn!(order_id = %id, error, "Swap settled but a later step failed");
        }

        let count = match self.orders.get_mut(id) {
            Some(mut entry) => {
                entry.order.execution_count += 1;
                entry.order.execution_count
            }
            None => return Err(TradeflowError::NotFound(format!("order {}", id))),
        };

        if order.order_type == OrderType::Dca {
            let done = order.params.max_executions.map_or(false, |max| count >= max);
            if !done {
                debug!(order_id = %id, executions = count, "DCA round executed");
                return Ok(order.status);
            }
        }

        self.update_status(id, OrderStatus::Triggered, None);
        self.update_status(id, OrderStatus::Completed, None);
        Ok(OrderStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionStatus, ExecutionErrorKind};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn templates() -> OrderTemplates {
        OrderTemplates::with_defaults(Arc::new(FlowStore::new()))
    }

    fn stop_loss() -> OrderParams {
        OrderParams {
            trigger_price: Some(dec!(3000)),
            sell_percent: Some(dec!(100)),
            ..OrderParams::for_token("ETH")
        }
    }

    fn execution(flow_id: &str, status: ExecutionStatus, ran: &[&str]) -> ExecutionResult {
        ExecutionResult {
            execution_id: "x".into(),
            flow_id: flow_id.into(),
            status,
            node_results: BTreeMap::new(),
            executed_nodes: ran.iter().map(|s| s.to_string()).collect(),
            output: None,
            error: (status == ExecutionStatus::Failed).then(|| "swap reverted".to_string()),
            error_kind: (status == ExecutionStatus::Failed).then_some(ExecutionErrorKind::Action),
            validation_errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 1,
        }
    }

    #[test]
    fn test_create_stop_loss_lifecycle() {
        let templates = templates();
        let (order, flow) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();

        assert_eq!(order.order_type, OrderType::StopLoss);
        assert_eq!(order.status, OrderStatus::Created);
        assert!(flow.name.contains("Stop-Loss"));
        assert_ne!(flow.id, order.id);

        assert!(templates.activate(&order.id));
        assert_eq!(templates.get(&order.id).unwrap().status, OrderStatus::Active);

        assert!(templates.update_status(&order.id, OrderStatus::Completed, None));
        assert!(!templates.activate(&order.id));
        assert!(!templates.cancel(&order.id));
        let stored = templates.get(&order.id).unwrap();
        assert_eq!(stored.status, OrderStatus::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn test_pause_resume_cancel() {
        let templates = templates();
        let (order, _) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();

        assert!(!templates.pause(&order.id));
        assert!(templates.activate(&order.id));
        assert!(templates.pause(&order.id));
        assert!(templates.activate(&order.id));
        assert!(templates.cancel(&order.id));
        assert!(!templates.activate(&order.id));
        assert!(!templates.cancel("missing"));
        assert!(!templates.update_status("missing", OrderStatus::Active, None));
    }

    #[test]
    fn test_invalid_params_create_nothing() {
        let templates = templates();
        let result = templates.create(OrderType::Dca, OrderParams::default());
        assert!(matches!(result, Err(TradeflowError::Validation(_))));
        assert!(templates.is_empty());
    }

    #[test]
    fn test_list_filters_then_paginates() {
        let templates = templates();
        let mut ids = Vec::new();
        for token in ["ETH", "BTC", "ETH", "ETH"] {
            let params = OrderParams {
                trigger_price: Some(dec!(10)),
                ..OrderParams::for_token(token)
            };
            ids.push(templates.create(OrderType::TakeProfit, params).unwrap().0.id);
        }
        templates.activate(&ids[3]);

        let eth = OrderFilter {
            token: Some("eth".into()),
            ..OrderFilter::default()
        };
        let listed: Vec<String> = templates.list(&eth).into_iter().map(|o| o.id).collect();
        assert_eq!(listed, vec![ids[3].clone(), ids[2].clone(), ids[0].clone()]);

        let page = OrderFilter {
            limit: Some(1),
            offset: Some(1),
            ..eth
        };
        assert_eq!(templates.list(&page)[0].id, ids[2]);

        let active = OrderFilter {
            status: Some(OrderStatus::Active),
            ..OrderFilter::default()
        };
        assert_eq!(templates.list(&active).len(), 1);
    }

    #[test]
    fn test_apply_execution() {
        let templates = templates();
        let (order, flow) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();
        let mut events = templates.subscribe();
        templates.activate(&order.id);

        // Condition not met: stays active.
        let idle = execution(&flow.id, ExecutionStatus::Completed, &["trigger", "get-data", "check-condition"]);
        assert_eq!(templates.apply_execution(&order.id, &idle).unwrap(), OrderStatus::Active);

        let fired = execution(&flow.id, ExecutionStatus::Completed, &["check-condition", NODE_SWAP, "notify"]);
        assert_eq!(templates.apply_execution(&order.id, &fired).unwrap(), OrderStatus::Completed);
        let stored = templates.get(&order.id).unwrap();
        assert!(stored.triggered_at.is_some());
        assert_eq!(stored.execution_count, 1);

        let seen: Vec<OrderStatus> = std::iter::from_fn(|| events.try_recv().ok()).map(|c| c.to).collect();
        assert_eq!(seen, vec![OrderStatus::Active, OrderStatus::Triggered, OrderStatus::Completed]);
    }

    #[test]
    fn test_failed_execution_fails_order() {
        let templates = templates();
        let (order, flow) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();
        templates.activate(&order.id);

        let failed = execution(&flow.id, ExecutionStatus::Failed, &["trigger"]);
        assert_eq!(templates.apply_execution(&order.id, &failed).unwrap(), OrderStatus::Failed);
        assert_eq!(templates.get(&order.id).unwrap().error.as_deref(), Some("swap reverted"));
    }

    #[test]
    fn test_dca_completes_after_max_executions() {
        let templates = templates();
        let params = OrderParams {
            buy_token: Some("ETH".into()),
            sell_token: Some("USDC".into()),
            amount: Some(dec!(10)),
            interval: Some("1h".into()),
            max_executions: Some(2),
            ..OrderParams::default()
        };
        let (order, flow) = templates.create(OrderType::Dca, params).unwrap();
        templates.activate(&order.id);

        let round = execution(&flow.id, ExecutionStatus::Completed, &["trigger", NODE_SWAP, "notify"]);
        assert_eq!(templates.apply_execution(&order.id, &round).unwrap(), OrderStatus::Active);
        assert_eq!(templates.apply_execution(&order.id, &round).unwrap(), OrderStatus::Completed);
    }

    #[test]
    fn test_notify_failure_after_settled_swap_completes() {
        let templates = templates();
        let (order, flow) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();
        templates.activate(&order.id);

        let mut result = execution(&flow.id, ExecutionStatus::Failed, &["check-condition", NODE_SWAP, "notify"]);
        result.error = Some("Node 'notify' failed: channel offline".into());
        result.node_results.insert(NODE_SWAP.into(), serde_json::json!({ "txId": "paper-1" }));
        result
            .node_results
            .insert("notify".into(), serde_json::json!({ "success": false, "error": "channel offline" }));

        assert_eq!(templates.apply_execution(&order.id, &result).unwrap(), OrderStatus::Completed);
        let stored = templates.get(&order.id).unwrap();
        assert!(stored.triggered_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.execution_count, 1);
        assert!(stored.error.is_none());
    }

    #[test]
    fn test_rejected_swap_fails_order() {
        let templates = templates();
        let (order, flow) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();
        templates.activate(&order.id);

        let mut result = execution(&flow.id, ExecutionStatus::Failed, &["check-condition", NODE_SWAP]);
        result
            .node_results
            .insert(NODE_SWAP.into(), serde_json::json!({ "success": false, "error": "swap reverted" }));

        assert_eq!(templates.apply_execution(&order.id, &result).unwrap(), OrderStatus::Failed);
        let stored = templates.get(&order.id).unwrap();
        assert_eq!(stored.execution_count, 0);
        assert!(stored.triggered_at.is_none());
    }

    #[test]
    fn test_swap_settled_while_paused_still_counts() {
        let templates = templates();
        let (order, flow) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();
        templates.activate(&order.id);
        templates.pause(&order.id);

        let fired = execution(&flow.id, ExecutionStatus::Completed, &["check-condition", NODE_SWAP, "notify"]);
        assert_eq!(templates.apply_execution(&order.id, &fired).unwrap(), OrderStatus::Completed);
        assert!(!templates.activate(&order.id));

        // Without a swap, a paused order ignores results
        let (other, other_flow) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();
        templates.activate(&other.id);
        templates.pause(&other.id);
        let idle = execution(&other_flow.id, ExecutionStatus::Failed, &["trigger"]);
        assert_eq!(templates.apply_execution(&other.id, &idle).unwrap(), OrderStatus::Paused);
    }

    #[test]
    fn test_cancelled_order_ignores_settled_swap() {
        let templates = templates();
        let (order, flow) = templates.create(OrderType::StopLoss, stop_loss()).unwrap();
        templates.activate(&order.id);
        templates.cancel(&order.id);

        let fired = execution(&flow.id, ExecutionStatus::Completed, &[NODE_SWAP]);
        assert_eq!(templates.apply_execution(&order.id, &fired).unwrap(), OrderStatus::Cancelled);
        assert_eq!(templates.get(&order.id).unwrap().execution_count, 0);
    }
}
