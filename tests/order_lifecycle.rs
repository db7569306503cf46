use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tradeflow::config::AppConfig;
use tradeflow::orders::{OrderFilter, OrderParams, OrderStatus, OrderType};
use tradeflow::runtime::{OrchestratorContext, RuntimeEngine};
use tradeflow::PaperMarket;

fn runtime() -> (RuntimeEngine, PaperMarket) {
    let mut config = AppConfig::default();
    config.orders.default_check_interval_ms = 1_000;
    let ctx = Arc::new(OrchestratorContext::new(config));
    let market = ctx.register_builtin_plugins();
    (RuntimeEngine::new(ctx), market)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn trailing_stop_fires_on_drawdown_before_trigger_price() {
    let (runtime, market) = runtime();
    runtime.start().await.unwrap();

    let params = OrderParams {
        trigger_price: Some(dec!(2000)),
        trail_percent: Some(dec!(8)),
        ..OrderParams::for_token("ETH")
    };
    let order = runtime.create_order(OrderType::StopLoss, params, true).unwrap();

    market.set_price("ETH", dec!(3500));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(runtime.context().orders.get(&order.id).unwrap().status, OrderStatus::Active);

    // 3500 -> 3200 is an 8.57% drawdown, well above the 2000 trigger price
    market.set_price("ETH", dec!(3200));
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    settle().await;

    let stored = runtime.context().orders.get(&order.id).unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    let fills = market.fills();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].side, "sell");
    assert_eq!(fills[0].price, dec!(3200));

    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dca_buys_until_max_executions() {
    let (runtime, market) = runtime();
    runtime.start().await.unwrap();

    let params = OrderParams {
        buy_token: Some("SOL".into()),
        sell_token: Some("USDC".into()),
        amount: Some(dec!(50)),
        interval: Some("1m".into()),
        max_executions: Some(2),
        ..OrderParams::default()
    };
    let order = runtime.create_order(OrderType::Dca, params, true).unwrap();

    tokio::time::sleep(Duration::from_secs(200)).await;
    settle().await;

    let stored = runtime.context().orders.get(&order.id).unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(stored.execution_count, 2);
    assert_eq!(market.fills().len(), 2);
    assert!(market.fills().iter().all(|f| f.buy_token == "SOL"));
    assert!(runtime.schedule_for(&order.id).is_none());

    runtime.stop().await;
}

#[tokio::test(start_paused = true)]
async fn conditional_buy_waits_for_snapshot_conditions() {
    let mut config = AppConfig::default();
    config.orders.default_check_interval_ms = 1_000;
    config
        .paper
        .snapshots
        .insert("SOL".into(), [("volume".to_string(), serde_json::json!(500))].into());
    let ctx = Arc::new(OrchestratorContext::new(config));
    let market = ctx.register_builtin_plugins();
    let runtime = RuntimeEngine::new(ctx);
    runtime.start().await.unwrap();

    let params = OrderParams {
        amount: Some(dec!(25)),
        conditions: tradeflow::orders::parse_conditions(&["price<140", "volume>=100"]).unwrap(),
        ..OrderParams::for_token("SOL")
    };
    let order = runtime.create_order(OrderType::ConditionalBuy, params, true).unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(runtime.context().orders.get(&order.id).unwrap().status, OrderStatus::Active);

    market.set_price("SOL", dec!(135));
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    settle().await;
    assert_eq!(runtime.context().orders.get(&order.id).unwrap().status, OrderStatus::Completed);
    assert_eq!(market.fills()[0].buy_token, "SOL");

    runtime.stop().await;
}

#[tokio::test]
async fn invalid_orders_never_reach_the_store() {
    let (runtime, _) = runtime();
    let result = runtime.create_order(OrderType::TakeProfit, OrderParams::for_token("ETH"), true);
    assert!(result.is_err());

    let result = runtime.create_order(
        OrderType::Dca,
        OrderParams {
            buy_token: Some("ETH".into()),
            sell_token: Some("USDC".into()),
            amount: Some(dec!(10)),
            interval: Some("90m".into()),
            ..OrderParams::default()
        },
        false,
    );
    assert!(result.is_err());
    assert!(runtime.context().orders.list(&OrderFilter::default()).is_empty());
    assert!(runtime.context().flows.is_empty());
}
