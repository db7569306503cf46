//! JSON state file
//!
//! Flows and orders survive between CLI invocations in a single pretty JSON
//! document. Writes go to a sibling temp file first and are renamed into
//! place, so a crash never leaves a half-written state file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{Result, TradeflowError};
use crate::flow::Flow;
use crate::orders::Order;
use crate::runtime::OrchestratorContext;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    pub version: u32,
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub orders: Vec<Order>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: None,
            flows: Vec::new(),
            orders: Vec::new(),
        }
    }
}

impl StateFile {
    /// Snapshot every flow and order in the context
    pub fn capture(ctx: &OrchestratorContext) -> Self {
        let mut flows = ctx.flows.list();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        // Oldest first, so restoring preserves insertion order
        let mut orders = ctx.orders.list(&Default::default());
        orders.reverse();
        Self {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            flows,
            orders,
        }
    }

    /// Load flows and orders into the context, returning how many of each
    pub fn restore(self, ctx: &OrchestratorContext) -> (usize, usize) {
        let counts = (self.flows.len(), self.orders.len());
        for flow in self.flows {
            ctx.flows.insert(flow);
        }
        for order in self.orders {
            ctx.orders.insert(order);
        }
        debug!(flows = counts.0, orders = counts.1, "State restored");
        counts
    }
}

/// Read the state file; a missing file is an empty state
pub async fn load(path: &Path) -> Result<StateFile> {
    let body = match tokio::fs::read_to_string(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateFile::default()),
        Err(e) => return Err(TradeflowError::Io(e)),
    };
    let state: StateFile = serde_json::from_str(&body)?;
    if state.version > STATE_VERSION {
        return Err(TradeflowError::Validation(format!(
            "state file {} has version {}, newer than supported {}",
            path.display(),
            state.version,
            STATE_VERSION
        )));
    }
    Ok(state)
}

pub async fn save(path: &Path, state: &StateFile) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(TradeflowError::Internal(format!("invalid state path {}", path.display())));
    };
    if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(state)?;
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), flows = state.flows.len(), orders = state.orders.len(), "State saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::orders::{OrderParams, OrderStatus, OrderType};
    use rust_decimal_macros::dec;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("tradeflow_state_{}_{}", tag, uuid::Uuid::new_v4().simple()))
            .join("state.json")
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_state() {
        let state = load(&temp_path("missing")).await.unwrap();
        assert!(state.flows.is_empty());
        assert!(state.orders.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_restore_context() {
        let ctx = OrchestratorContext::new(AppConfig::default());
        let params = OrderParams {
            trigger_price: Some(dec!(2500)),
            ..OrderParams::for_token("ETH")
        };
        let (first, _) = ctx.orders.create(OrderType::StopLoss, params.clone()).unwrap();
        let (second, _) = ctx.orders.create(OrderType::TakeProfit, OrderParams {
            trigger_price: Some(dec!(4000)),
            ..params
        }).unwrap();
        ctx.orders.activate(&second.id);
        ctx.flows.create_from_template("conditional").unwrap();

        let path = temp_path("roundtrip");
        save(&path, &StateFile::capture(&ctx)).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let restored = OrchestratorContext::new(AppConfig::default());
        let (flows, orders) = load(&path).await.unwrap().restore(&restored);
        assert_eq!((flows, orders), (3, 2));

        let order = restored.orders.get(&second.id).unwrap();
        assert_eq!(order.status, OrderStatus::Active);
        assert!(restored.flows.get(&order.flow_id).is_some());
        let listed: Vec<String> = restored.orders.list(&Default::default()).into_iter().map(|o| o.id).collect();
        let original: Vec<String> = ctx.orders.list(&Default::default()).into_iter().map(|o| o.id).collect();
        assert_eq!(listed, original);
        assert!(listed.contains(&first.id));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(matches!(load(&path).await, Err(TradeflowError::Json(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
