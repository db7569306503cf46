use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::condition::{ConditionItem, LogicalOperator};
use crate::error::TradeflowError;

/// Order kind; each compiles to a fixed flow shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    StopLoss,
    TakeProfit,
    Dca,
    ConditionalBuy,
    ConditionalSell,
}

impl OrderType {
    pub const ALL: [OrderType; 5] = [
        OrderType::StopLoss,
        OrderType::TakeProfit,
        OrderType::Dca,
        OrderType::ConditionalBuy,
        OrderType::ConditionalSell,
    ];

    /// Human-readable label used in compiled flow names
    pub fn title(&self) -> &'static str {
        match self {
            OrderType::StopLoss => "Stop-Loss",
            OrderType::TakeProfit => "Take-Profit",
            OrderType::Dca => "DCA",
            OrderType::ConditionalBuy => "Conditional Buy",
            OrderType::ConditionalSell => "Conditional Sell",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::StopLoss => write!(f, "stop-loss"),
            OrderType::TakeProfit => write!(f, "take-profit"),
            OrderType::Dca => write!(f, "dca"),
            OrderType::ConditionalBuy => write!(f, "conditional-buy"),
            OrderType::ConditionalSell => write!(f, "conditional-sell"),
        }
    }
}

impl FromStr for OrderType {
    type Err = TradeflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderType::ALL
            .into_iter()
            .find(|t| t.to_string() == s.to_ascii_lowercase())
            .ok_or_else(|| TradeflowError::Validation(format!("unknown order type '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Created,
    Active,
    Paused,
    Triggered,
    Completed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Whether `self -> to` is an edge of the order lifecycle
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Created, Active)
                | (Paused, Active)
                | (Active, Paused)
                | (Active, Triggered)
                | (Triggered, Completed)
                | (Created | Active | Paused, Cancelled)
                | (Created | Active | Paused | Triggered, Failed)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Created => write!(f, "created"),
            OrderStatus::Active => write!(f, "active"),
            OrderStatus::Paused => write!(f, "paused"),
            OrderStatus::Triggered => write!(f, "triggered"),
            OrderStatus::Completed => write!(f, "completed"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for OrderStatus {
    type Err = TradeflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(OrderStatus::Created),
            "active" => Ok(OrderStatus::Active),
            "paused" => Ok(OrderStatus::Paused),
            "triggered" => Ok(OrderStatus::Triggered),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(TradeflowError::Validation(format!("unknown order status '{}'", other))),
        }
    }
}

/// Type-specific order parameters. Which fields are required depends on
/// the order type; the compiler checks them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_price: Option<Decimal>,
    /// Share of the position to sell, 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell_percent: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buy_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    /// DCA cadence: `Nm`, `1h`/`hourly`, `1d`/`daily`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_operator: Option<LogicalOperator>,
    /// Trailing stop distance from the observed peak, in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail_percent: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slippage_bps: Option<u32>,
    /// Notification channels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_ms: Option<u64>,
}

impl OrderParams {
    pub fn for_token(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            ..Self::default()
        }
    }

    /// Whether any token field names `token` (case-insensitive)
    pub fn mentions_token(&self, token: &str) -> bool {
        [&self.token, &self.buy_token, &self.sell_token]
            .into_iter()
            .flatten()
            .any(|t| t.eq_ignore_ascii_case(token))
    }
}

/// A declarative trading intent backed by one compiled flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub params: OrderParams,
    pub flow_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Runs in which the swap executed
    #[serde(default)]
    pub execution_count: u32,
}

impl Order {
    /// Token shown in listings
    pub fn display_token(&self) -> String {
        match self.order_type {
            OrderType::Dca => format!(
                "{}→{}",
                self.params.sell_token.as_deref().unwrap_or("?"),
                self.params.buy_token.as_deref().unwrap_or("?")
            ),
            _ => self.params.token.clone().unwrap_or_else(|| "?".to_string()),
        }
    }
}

/// Emitted whenever an order changes status
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusChange {
    pub order_id: String,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub order_type: Option<OrderType>,
    pub token: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.status.map_or(true, |s| order.status == s)
            && self.order_type.map_or(true, |t| order.order_type == t)
            && self
                .token
                .as_deref()
                .map_or(true, |t| order.params.mentions_token(t))
    }
}
