//! Paper trading plugin
//!
//! Serves prices from an in-memory book and fills swaps without touching a
//! venue. Every fill is reported with `dryRun: true`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PaperConfig;
use crate::engine::{ActionResult, BoundPlugin, Plugin, PluginContext};
use crate::error::{Result, TradeflowError};

pub const PAPER_PLUGIN: &str = "paper";

const PROVIDER_PRICE: &str = "price";
const PROVIDER_SNAPSHOT: &str = "token_snapshot";
const ACTION_SWAP: &str = "swap";
const ACTION_NOTIFY: &str = "notify";

#[derive(Debug, Clone, Copy)]
struct Quote {
    price: Decimal,
    peak: Decimal,
}

/// A simulated swap
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperFill {
    pub tx_id: String,
    pub order_id: Option<String>,
    pub side: String,
    pub sell_token: String,
    pub buy_token: String,
    pub price: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// Shared handle to the paper book. Clones see the same prices and fills,
/// so a caller can move the market while flows are running.
#[derive(Clone, Default)]
pub struct PaperMarket {
    quotes: Arc<DashMap<String, Quote>>,
    fills: Arc<Mutex<Vec<PaperFill>>>,
}

impl PaperMarket {
    pub fn from_config(config: &PaperConfig) -> Self {
        let market = Self::default();
        for (token, price) in &config.prices {
            market.set_price(token, *price);
        }
        market
    }

    /// Set the current price; the running peak only ever rises
    pub fn set_price(&self, token: &str, price: Decimal) {
        let key = token.to_ascii_uppercase();
        self.quotes
            .entry(key)
            .and_modify(|q| {
                q.price = price;
                q.peak = q.peak.max(price);
            })
            .or_insert(Quote { price, peak: price });
        debug!(token, %price, "Paper price set");
    }

    pub fn price(&self, token: &str) -> Option<Decimal> {
        self.quotes.get(&token.to_ascii_uppercase()).map(|q| q.price)
    }

    pub fn fills(&self) -> Vec<PaperFill> {
        self.fills.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn quote(&self, token: &str) -> Option<Quote> {
        self.quotes.get(&token.to_ascii_uppercase()).map(|q| *q)
    }

    fn record(&self, fill: PaperFill) {
        self.fills.lock().unwrap_or_else(|e| e.into_inner()).push(fill);
    }
}

fn number(d: Decimal) -> Value {
    d.to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(d.to_string()))
}

fn str_field<'a>(input: &'a Value, field: &str) -> Option<&'a str> {
    input.get(field).and_then(Value::as_str)
}

/// Unbound paper plugin, registered at startup and bound by the runtime
pub struct PaperPlugin {
    market: PaperMarket,
    snapshots: BTreeMap<String, BTreeMap<String, Value>>,
    fail_swaps: bool,
}

impl PaperPlugin {
    pub fn new(config: &PaperConfig) -> Self {
        Self {
            market: PaperMarket::from_config(config),
            snapshots: config.snapshots.clone(),
            fail_swaps: config.fail_swaps,
        }
    }

    pub fn market(&self) -> PaperMarket {
        self.market.clone()
    }
}

impl Plugin for PaperPlugin {
    fn name(&self) -> &str {
        PAPER_PLUGIN
    }

    fn bind(&self, ctx: &PluginContext) -> Result<Arc<dyn BoundPlugin>> {
        let fail_swaps = match ctx.settings_for(PAPER_PLUGIN).get("failSwaps") {
            None | Some(Value::Null) => self.fail_swaps,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(TradeflowError::Plugin(format!(
                    "paper: failSwaps must be a boolean, got {}",
                    other
                )))
            }
        };
        Ok(Arc::new(BoundPaper {
            market: self.market.clone(),
            snapshots: self
                .snapshots
                .iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), v.clone()))
                .collect(),
            fail_swaps,
        }))
    }
}

struct BoundPaper {
    market: PaperMarket,
    snapshots: BTreeMap<String, BTreeMap<String, Value>>,
    fail_swaps: bool,
}

impl BoundPaper {
    fn price_data(&self, token: &str) -> Option<Map<String, Value>> {
        let quote = self.market.quote(token)?;
        let drawdown = if quote.peak > Decimal::ZERO {
            (quote.peak - quote.price) / quote.peak * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        let mut data = Map::new();
        data.insert("token".into(), json!(token.to_ascii_uppercase()));
        data.insert("price".into(), number(quote.price));
        data.insert("peakPrice".into(), number(quote.peak));
        data.insert("drawdownPercent".into(), number(drawdown.round_dp(4)));
        Some(data)
    }

    fn swap(&self, input: &Value) -> ActionResult {
        if self.fail_swaps {
            return ActionResult::fail("paper swaps are disabled");
        }
        let side = str_field(input, "side").unwrap_or("buy");
        let (Some(sell), Some(buy)) = (str_field(input, "sellToken"), str_field(input, "buyToken")) else {
            return ActionResult::fail("swap requires sellToken and buyToken");
        };
        let priced = if side == "sell" { sell } else { buy };
        let Some(price) = self.market.price(priced) else {
            return ActionResult::fail(format!("no paper price for {}", priced));
        };

        let fill = PaperFill {
            tx_id: format!("paper-{}", Uuid::new_v4().simple()),
            order_id: str_field(input, "orderId").map(str::to_string),
            side: side.to_string(),
            sell_token: sell.to_string(),
            buy_token: buy.to_string(),
            price,
            executed_at: Utc::now(),
        };
        info!(
            tx_id = %fill.tx_id,
            order_id = ?fill.order_id,
            side,
            sell_token = sell,
            buy_token = buy,
            %price,
            "DRY RUN: paper swap filled"
        );

        let mut data = json!({
            "txId": fill.tx_id,
            "side": side,
            "sellToken": sell,
            "buyToken": buy,
            "price": number(price),
            "executedAt": fill.executed_at,
            "dryRun": true,
        });
        for field in ["orderId", "amount", "sellPercent", "slippageBps"] {
            if let Some(value) = input.get(field) {
                data[field] = value.clone();
            }
        }
        self.market.record(fill);
        ActionResult::ok(data)
    }

    fn notify(&self, input: &Value) -> ActionResult {
        let message = str_field(input, "message").unwrap_or("");
        let channels = input.get("channels").cloned().unwrap_or_else(|| json!([]));
        info!(
            order_id = ?str_field(input, "orderId"),
            channels = %channels,
            "Notification: {}",
            message
        );
        ActionResult::ok(json!({ "delivered": true, "message": message, "channels": channels }))
    }
}

#[async_trait]
impl BoundPlugin for BoundPaper {
    fn name(&self) -> &str {
        PAPER_PLUGIN
    }

    fn actions(&self) -> Vec<String> {
        vec![ACTION_SWAP.to_string(), ACTION_NOTIFY.to_string()]
    }

    fn providers(&self) -> Vec<String> {
        vec![PROVIDER_PRICE.to_string(), PROVIDER_SNAPSHOT.to_string()]
    }

    async fn execute_action(&self, action: &str, input: Value) -> Result<ActionResult> {
        match action {
            ACTION_SWAP => Ok(self.swap(&input)),
            ACTION_NOTIFY => Ok(self.notify(&input)),
            other => Err(TradeflowError::Plugin(format!("paper: unknown action '{}'", other))),
        }
    }

    async fn get_data(&self, provider: &str, query: Value) -> Result<ActionResult> {
        let Some(token) = str_field(&query, "token") else {
            return Ok(ActionResult::fail(format!("{} requires a token", provider)));
        };
        let Some(mut data) = self.price_data(token) else {
            return Ok(ActionResult::fail(format!("no paper price for {}", token)));
        };

        match provider {
            PROVIDER_PRICE => {}
            PROVIDER_SNAPSHOT => {
                if let Some(extra) = self.snapshots.get(&token.to_ascii_uppercase()) {
                    for (k, v) in extra {
                        data.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
            other => return Err(TradeflowError::Plugin(format!("paper: unknown provider '{}'", other))),
        }
        Ok(ActionResult::ok(Value::Object(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HookRegistry;
    use rust_decimal_macros::dec;

    fn bound(config: PaperConfig) -> (PaperMarket, Arc<dyn BoundPlugin>) {
        let plugin = PaperPlugin::new(&config);
        let ctx = PluginContext {
            settings: Value::Null,
            hooks: Arc::new(HookRegistry::default()),
        };
        (plugin.market(), plugin.bind(&ctx).unwrap())
    }

    #[tokio::test]
    async fn test_price_tracks_peak_and_drawdown() {
        let (market, paper) = bound(PaperConfig::default());
        market.set_price("eth", dec!(3200));
        market.set_price("ETH", dec!(2880));

        let result = paper.get_data("price", json!({ "token": "eth" })).await.unwrap();
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["token"], "ETH");
        assert_eq!(data["price"], json!(2880.0));
        assert_eq!(data["peakPrice"], json!(3200.0));
        assert_eq!(data["drawdownPercent"], json!(10.0));
    }

    #[tokio::test]
    async fn test_snapshot_merges_configured_fields() {
        let mut config = PaperConfig::default();
        config
            .snapshots
            .insert("sol".into(), BTreeMap::from([("mcap".to_string(), json!(70_000_000_000u64))]));
        let (_, paper) = bound(config);

        let data = paper
            .get_data("token_snapshot", json!({ "token": "SOL" }))
            .await
            .unwrap()
            .data
            .unwrap();
        assert_eq!(data["price"], json!(150.0));
        assert_eq!(data["mcap"], json!(70_000_000_000u64));
    }

    #[tokio::test]
    async fn test_unknown_token_is_business_failure() {
        let (_, paper) = bound(PaperConfig::default());
        let result = paper.get_data("price", json!({ "token": "DOGE" })).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("DOGE"));
    }

    #[tokio::test]
    async fn test_swap_records_fill() {
        let (market, paper) = bound(PaperConfig::default());
        let input = json!({
            "orderId": "o-1",
            "side": "sell",
            "sellToken": "ETH",
            "buyToken": "USDC",
            "sellPercent": 100,
        });
        let result = paper.execute_action("swap", input).await.unwrap();
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["dryRun"], true);
        assert_eq!(data["price"], json!(3000.0));
        assert!(data["txId"].as_str().unwrap().starts_with("paper-"));

        let fills = market.fills();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id.as_deref(), Some("o-1"));
    }

    #[tokio::test]
    async fn test_failing_swaps() {
        let (market, paper) = bound(PaperConfig {
            fail_swaps: true,
            ..PaperConfig::default()
        });
        let input = json!({ "side": "buy", "sellToken": "USDC", "buyToken": "ETH" });
        let result = paper.execute_action("swap", input).await.unwrap();
        assert!(!result.success);
        assert!(market.fills().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_operation_is_error() {
        let (_, paper) = bound(PaperConfig::default());
        assert!(paper.execute_action("bridge", Value::Null).await.is_err());
        assert!(paper.get_data("orderbook", json!({ "token": "ETH" })).await.is_err());
    }

    #[test]
    fn test_bind_rejects_bad_settings() {
        let plugin = PaperPlugin::new(&PaperConfig::default());
        let ctx = PluginContext {
            settings: json!({ "paper": { "failSwaps": "yes" } }),
            hooks: Arc::new(HookRegistry::default()),
        };
        assert!(plugin.bind(&ctx).is_err());
    }
}
