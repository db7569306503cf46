//! `tradeflow order`: create and manage orders.

use anyhow::{anyhow, bail};
use clap::{Args, Subcommand};
use rust_decimal::Decimal;
use tabled::Tabled;

use super::output::{self, OutputMode};
use crate::condition::LogicalOperator;
use crate::orders::{parse_conditions, Order, OrderFilter, OrderParams, OrderStatus, OrderType};
use crate::runtime::RuntimeEngine;

#[derive(Subcommand, Debug, Clone)]
pub enum OrderCommands {
    /// Create an order (activated unless --no-activate)
    Create(CreateArgs),
    /// List orders, newest first
    List {
        #[arg(long)]
        status: Option<OrderStatus>,
        #[arg(long = "type")]
        order_type: Option<OrderType>,
        /// Matches token, buy token or sell token
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one order
    Get { id: String },
    Cancel { id: String },
    Pause { id: String },
    /// Reactivate a paused order
    Resume { id: String },
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// stop-loss, take-profit, dca, conditional-buy or conditional-sell
    pub order_type: OrderType,
    #[arg(long)]
    pub token: Option<String>,
    #[arg(long)]
    pub trigger_price: Option<Decimal>,
    #[arg(long)]
    pub stop_price: Option<Decimal>,
    #[arg(long)]
    pub target_price: Option<Decimal>,
    /// Percent of the position to sell (default 100)
    #[arg(long)]
    pub sell_percent: Option<Decimal>,
    #[arg(long)]
    pub buy_token: Option<String>,
    #[arg(long)]
    pub sell_token: Option<String>,
    #[arg(long)]
    pub amount: Option<Decimal>,
    /// DCA cadence: 5m, 1h, 1d, hourly, daily
    #[arg(long)]
    pub interval: Option<String>,
    #[arg(long)]
    pub max_executions: Option<u32>,
    /// Condition such as `mcap>50000000`; repeatable
    #[arg(long = "condition")]
    pub conditions: Vec<String>,
    /// Require any condition instead of all
    #[arg(long)]
    pub any: bool,
    /// Trailing stop distance from the peak, in percent
    #[arg(long)]
    pub trail_percent: Option<Decimal>,
    #[arg(long)]
    pub slippage_bps: Option<u32>,
    /// Notification channel; repeatable
    #[arg(long)]
    pub notify: Vec<String>,
    /// How often price-watching orders check, in milliseconds
    #[arg(long)]
    pub check_interval_ms: Option<u64>,
    #[arg(long)]
    pub no_activate: bool,
}

impl CreateArgs {
    pub fn params(&self) -> anyhow::Result<OrderParams> {
        Ok(OrderParams {
            token: self.token.clone(),
            trigger_price: self.trigger_price,
            stop_price: self.stop_price,
            target_price: self.target_price,
            sell_percent: self.sell_percent,
            buy_token: self.buy_token.clone(),
            sell_token: self.sell_token.clone(),
            amount: self.amount,
            interval: self.interval.clone(),
            max_executions: self.max_executions,
            conditions: parse_conditions(&self.conditions)?,
            condition_operator: self.any.then_some(LogicalOperator::Or),
            trail_percent: self.trail_percent,
            slippage_bps: self.slippage_bps,
            notify: self.notify.clone(),
            check_interval_ms: self.check_interval_ms,
        })
    }
}

#[derive(Debug, Tabled)]
pub struct OrderRow {
    pub id: String,
    #[tabled(rename = "type")]
    pub order_type: String,
    pub status: String,
    pub token: String,
    pub runs: u32,
    pub created: String,
    pub error: String,
}

impl From<&Order> for OrderRow {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id.clone(),
            order_type: order.order_type.to_string(),
            status: order.status.to_string(),
            token: order.display_token(),
            runs: order.execution_count,
            created: order.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            error: order.error.clone().unwrap_or_default(),
        }
    }
}

/// Returns whether any state changed
pub fn run(cmd: OrderCommands, runtime: &RuntimeEngine, mode: OutputMode) -> anyhow::Result<bool> {
    let orders = &runtime.context().orders;
    let refused = |verb: &str, id: &str| -> anyhow::Error {
        match orders.get(id) {
            Some(order) => anyhow!("cannot {} order {} (status: {})", verb, id, order.status),
            None => anyhow!("order {} not found", id),
        }
    };

    match cmd {
        OrderCommands::Create(args) => {
            let order = runtime.create_order(args.order_type, args.params()?, !args.no_activate)?;
            output::print_success(&format!("Created {} order {}", order.order_type, order.id), mode);
            match mode {
                OutputMode::Table => output::print_rows(&[OrderRow::from(&order)], &[&order], mode)?,
                OutputMode::Json => output::print_item(&order)?,
            }
            Ok(true)
        }
        OrderCommands::List {
            status,
            order_type,
            token,
            limit,
        } => {
            let filter = OrderFilter {
                status,
                order_type,
                token,
                limit,
                offset: None,
            };
            let listed = orders.list(&filter);
            let rows: Vec<OrderRow> = listed.iter().map(OrderRow::from).collect();
            output::print_rows(&rows, &listed, mode)?;
            Ok(false)
        }
        OrderCommands::Get { id } => {
            let order = orders.get(&id).ok_or_else(|| anyhow!("order {} not found", id))?;
            output::print_item(&order)?;
            Ok(false)
        }
        OrderCommands::Cancel { id } => {
            if !runtime.cancel_order(&id) {
                return Err(refused("cancel", &id));
            }
            output::print_success(&format!("Cancelled order {}", id), mode);
            Ok(true)
        }
        OrderCommands::Pause { id } => {
            if !runtime.pause_order(&id) {
                return Err(refused("pause", &id));
            }
            output::print_success(&format!("Paused order {}", id), mode);
            Ok(true)
        }
        OrderCommands::Resume { id } => {
            if orders.get(&id).map(|o| o.status) != Some(OrderStatus::Paused) {
                return Err(refused("resume", &id));
            }
            if !runtime.activate_order(&id)? {
                bail!("order {} could not be resumed", id);
            }
            output::print_success(&format!("Resumed order {}", id), mode);
            Ok(true)
        }
    }
}
