//! Orders
//!
//! Declarative trading intents (stop-loss, take-profit, DCA, conditional
//! buy/sell), the compiler that turns each into a flow, and the lifecycle
//! manager.

pub mod compiler;
mod manager;
mod types;

pub use compiler::{interval_to_cron, parse_conditions, CompileOptions};
pub use manager::OrderTemplates;
pub use types::{Order, OrderFilter, OrderParams, OrderStatus, OrderStatusChange, OrderType};
