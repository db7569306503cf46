//! Order compiler
//!
//! Every order type maps to one fixed flow shape. Node ids are stable across
//! orders so execution results can be interpreted without the graph.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::types::{OrderParams, OrderType};
use crate::condition::{ComparisonOperator, Condition, ConditionGroup, ConditionItem, LogicalOperator};
use crate::config::OrderConfig;
use crate::error::{Result, TradeflowError};
use crate::flow::{
    Edge, FlowDraft, FlowSettings, Node, OutputType, TriggerConfig, TriggerData, TriggerType,
    HANDLE_FALSE, HANDLE_OUTPUT, HANDLE_TRUE,
};

pub const NODE_TRIGGER: &str = "trigger";
pub const NODE_GET_DATA: &str = "get-data";
pub const NODE_CHECK: &str = "check-condition";
pub const NODE_SWAP: &str = "execute-swap";
pub const NODE_NOTIFY: &str = "notify";
pub const NODE_IDLE: &str = "not-triggered";

/// Compile-time knobs that come from configuration, not from the order
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub orders: OrderConfig,
    pub max_execution_time_ms: u64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            orders: OrderConfig::default(),
            max_execution_time_ms: 60_000,
        }
    }
}

/// Map a DCA interval to the supported cron subset
pub fn interval_to_cron(interval: &str) -> Result<String> {
    let normalized = interval.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1h" | "hourly" => return Ok("@hourly".to_string()),
        "1d" | "daily" => return Ok("@daily".to_string()),
        _ => {}
    }
    if let Some(minutes) = normalized.strip_suffix('m') {
        if let Ok(n) = minutes.parse::<u32>() {
            if (1..=59).contains(&n) {
                return Ok(format!("*/{} * * * *", n));
            }
        }
    }
    Err(TradeflowError::Validation(format!(
        "unsupported interval '{}' (use Nm with N in 1..59, 1h/hourly or 1d/daily)",
        interval
    )))
}

fn decimal_value(d: Decimal) -> Value {
    d.to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(d.to_string()))
}

fn require<'a, T>(value: &'a Option<T>, order_type: OrderType, field: &str) -> Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| TradeflowError::Validation(format!("{} order requires '{}'", order_type, field)))
}

fn positive(value: Decimal, field: &str) -> Result<Decimal> {
    if value <= Decimal::ZERO {
        return Err(TradeflowError::Validation(format!("'{}' must be positive", field)));
    }
    Ok(value)
}

fn sell_percent(params: &OrderParams) -> Result<Decimal> {
    let pct = params.sell_percent.unwrap_or(Decimal::ONE_HUNDRED);
    if pct <= Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
        return Err(TradeflowError::Validation(
            "'sellPercent' must be in (0, 100]".to_string(),
        ));
    }
    Ok(pct)
}

/// Build the flow draft for an order. The draft has no id yet; the caller
/// registers it, which assigns one independent of the order id.
pub fn compile(order_id: &str, order_type: OrderType, params: &OrderParams, options: &CompileOptions) -> Result<FlowDraft> {
    let cfg = &options.orders;
    let slippage = params.slippage_bps.unwrap_or(cfg.default_slippage_bps);

    let mut settings = FlowSettings {
        max_execution_time: options.max_execution_time_ms,
        retry_on_failure: true,
        ..FlowSettings::default()
    };

    let draft = match order_type {
        OrderType::StopLoss | OrderType::TakeProfit => {
            let token = require(&params.token, order_type, "token")?;
            let trigger = match order_type {
                OrderType::StopLoss => params.trigger_price.or(params.stop_price),
                _ => params.trigger_price.or(params.target_price),
            };
            let field = if order_type == OrderType::StopLoss {
                "triggerPrice|stopPrice"
            } else {
                "triggerPrice|targetPrice"
            };
            let trigger = positive(*require(&trigger, order_type, field)?, "triggerPrice")?;
            let pct = sell_percent(params)?;

            let (op, symbol) = match order_type {
                OrderType::StopLoss => (ComparisonOperator::Lte, "<="),
                _ => (ComparisonOperator::Gte, ">="),
            };
            let price_check = Condition::new("price", op, decimal_value(trigger));
            let group = match (order_type, params.trail_percent) {
                (OrderType::StopLoss, Some(trail)) => ConditionGroup::any([
                    price_check,
                    Condition::new(
                        "drawdownPercent",
                        ComparisonOperator::Gte,
                        decimal_value(positive(trail, "trailPercent")?),
                    ),
                ]),
                _ => ConditionGroup::all([price_check]),
            };

            let name = format!("{}: {} {} {}", order_type.title(), token, symbol, trigger);
            let swap = json!({
                "orderId": order_id,
                "side": "sell",
                "sellToken": token,
                "buyToken": cfg.quote_token,
                "sellPercent": decimal_value(pct),
                "slippageBps": slippage,
            });
            let message = format!("{} triggered for {} ({} {})", order_type.title(), token, symbol, trigger);
            watched(&name, cfg, token, &cfg.price_provider, group, swap, notify_params(order_id, &message, params))
        }

        OrderType::Dca => {
            let buy = require(&params.buy_token, order_type, "buyToken")?;
            let sell = require(&params.sell_token, order_type, "sellToken")?;
            let amount = positive(*require(&params.amount, order_type, "amount")?, "amount")?;
            let interval = require(&params.interval, order_type, "interval")?;
            let cron = interval_to_cron(interval)?;

            let name = format!("DCA: {} {} → {} every {}", amount, sell, buy, interval);
            let swap = json!({
                "orderId": order_id,
                "side": "buy",
                "sellToken": sell,
                "buyToken": buy,
                "amount": decimal_value(amount),
                "slippageBps": slippage,
            });
            let message = format!("DCA bought {} with {} {}", buy, amount, sell);
            FlowDraft::new(&name)
                .description(&format!("Recurring {} purchase", buy))
                .node(Node::trigger(NODE_TRIGGER, "Schedule", TriggerData::cron(&cron)))
                .node(Node::action(NODE_SWAP, "Execute Swap", &cfg.plugin, &cfg.swap_action, swap))
                .node(Node::action(
                    NODE_NOTIFY,
                    "Notify",
                    &cfg.plugin,
                    &cfg.notify_action,
                    notify_params(order_id, &message, params),
                ))
                .edge(Edge::new(NODE_TRIGGER, NODE_SWAP))
                .edge(Edge::new(NODE_SWAP, NODE_NOTIFY).with_handle(HANDLE_OUTPUT))
        }

        OrderType::ConditionalBuy | OrderType::ConditionalSell => {
            let token = require(&params.token, order_type, "token")?;
            if params.conditions.is_empty() {
                return Err(TradeflowError::Validation(format!(
                    "{} order requires at least one condition",
                    order_type
                )));
            }
            let group = ConditionGroup::new(
                params.condition_operator.unwrap_or(LogicalOperator::And),
                params.conditions.clone(),
            );

            let swap = if order_type == OrderType::ConditionalBuy {
                let amount = positive(*require(&params.amount, order_type, "amount")?, "amount")?;
                json!({
                    "orderId": order_id,
                    "side": "buy",
                    "sellToken": params.sell_token.as_deref().unwrap_or(&cfg.quote_token),
                    "buyToken": token,
                    "amount": decimal_value(amount),
                    "slippageBps": slippage,
                })
            } else {
                let mut swap = json!({
                    "orderId": order_id,
                    "side": "sell",
                    "sellToken": token,
                    "buyToken": params.buy_token.as_deref().unwrap_or(&cfg.quote_token),
                    "slippageBps": slippage,
                });
                match params.amount {
                    Some(amount) => swap["amount"] = decimal_value(positive(amount, "amount")?),
                    None => swap["sellPercent"] = decimal_value(sell_percent(params)?),
                }
                swap
            };

            let name = format!("{}: {} when {}", order_type.title(), token, group);
            let message = format!("{} executed for {}", order_type.title(), token);
            watched(&name, cfg, token, &cfg.snapshot_provider, group, swap, notify_params(order_id, &message, params))
        }
    };

    if order_type != OrderType::Dca {
        settings.default_check_interval = Some(params.check_interval_ms.unwrap_or(cfg.default_check_interval_ms));
    }
    Ok(draft.settings(settings))
}

fn notify_params(order_id: &str, message: &str, params: &OrderParams) -> Value {
    json!({
        "orderId": order_id,
        "message": message,
        "channels": params.notify,
    })
}

/// `Trigger → GetData → Condition → Swap → Notify`, with the false branch
/// ending in an idle output.
fn watched(
    name: &str,
    cfg: &OrderConfig,
    token: &str,
    provider: &str,
    group: ConditionGroup,
    swap: Value,
    notify: Value,
) -> FlowDraft {
    let schedule = TriggerData {
        trigger_type: TriggerType::Schedule,
        config: TriggerConfig::default(),
    };
    FlowDraft::new(name)
        .description(&format!("Watch {} and act when the condition holds", token))
        .node(Node::trigger(NODE_TRIGGER, "Schedule", schedule))
        .node(Node::provider(NODE_GET_DATA, "Get Data", &cfg.plugin, provider, json!({ "token": token })))
        .node(Node::condition(NODE_CHECK, "Check Condition", group))
        .node(Node::action(NODE_SWAP, "Execute Swap", &cfg.plugin, &cfg.swap_action, swap))
        .node(Node::action(NODE_NOTIFY, "Notify", &cfg.plugin, &cfg.notify_action, notify))
        .node(Node::output(NODE_IDLE, "Not Triggered", OutputType::Return))
        .edge(Edge::new(NODE_TRIGGER, NODE_GET_DATA))
        .edge(Edge::new(NODE_GET_DATA, NODE_CHECK).with_handle(HANDLE_OUTPUT))
        .edge(Edge::new(NODE_CHECK, NODE_SWAP).with_handle(HANDLE_TRUE))
        .edge(Edge::new(NODE_CHECK, NODE_IDLE).with_handle(HANDLE_FALSE))
        .edge(Edge::new(NODE_SWAP, NODE_NOTIFY).with_handle(HANDLE_OUTPUT))
}

/// Condition items from `field<op>value` strings
pub fn parse_conditions<S: AsRef<str>>(raw: &[S]) -> Result<Vec<ConditionItem>> {
    raw.iter()
        .map(|s| s.as_ref().parse::<Condition>().map(ConditionItem::from))
        .collect()
}
