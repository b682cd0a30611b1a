use std::sync::Arc;

use anyhow::Context;

use tradebot::config::EngineConfig;
use tradebot::dispatch::SignalDispatcher;
use tradebot::events::TracingSink;
use tradebot::exchange::sim::SimulatedExchange;
use tradebot::gateway::{CircuitBreaker, OrderGateway};
use tradebot::monitor::{MonitorConfig, MonitorDeps, MonitorRegistry};
use tradebot::risk::FixedFractionRiskGate;
use tradebot::store::{MemoryPositionStore, PositionStore};
use tradebot::strategy::{SmaCrossover, StrategyRegistry};
use tradebot::{MonitorKey, Timeframe};

const DEMO_MARKETS: &[(&str, f64)] = &[("BTCUSDT", 50_000.0), ("ETHUSDT", 3_000.0)];

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tradebot=info".to_string()),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 TradeBot engine starting");

    let config = EngineConfig::from_env()?;
    tracing::info!("📊 Configuration:");
    tracing::info!("  Account: {}", config.account_id);
    tracing::info!("  Equity: ${:.2}", config.equity);
    tracing::info!("  Max position: {}%", config.max_position_pct * 100.0);
    tracing::info!("  Stop loss: {}%", config.rules.stop_loss_pct * 100.0);
    tracing::info!(
        "  TP1: {}% ({}% of position), TP2: {}%, trailing callback: {}%",
        config.rules.take_profit_1_pct * 100.0,
        config.rules.take_profit_1_fraction * 100.0,
        config.rules.take_profit_2_pct * 100.0,
        config.rules.trailing_callback_pct * 100.0
    );

    let events = Arc::new(TracingSink);
    let mut exchange = SimulatedExchange::new(42);
    for (symbol, base_price) in DEMO_MARKETS {
        exchange = exchange.with_symbol(symbol, *base_price);
    }
    let exchange = Arc::new(exchange);
    let breaker = Arc::new(CircuitBreaker::new("sim", config.breaker.clone()));
    let gateway = Arc::new(OrderGateway::new(
        exchange,
        breaker,
        config.gateway.clone(),
        events.clone(),
    ));
    let store = Arc::new(MemoryPositionStore::new());

    let mut strategies = StrategyRegistry::new();
    strategies.register(Arc::new(SmaCrossover::new(5, 20)))?;

    let risk = Arc::new(FixedFractionRiskGate::new(
        config.equity,
        config.max_position_pct,
    ));
    let dispatcher = Arc::new(SignalDispatcher::new(
        strategies,
        risk,
        chrono::Duration::seconds(config.staleness_window_secs as i64),
        events.clone(),
    ));

    let mut registry = MonitorRegistry::new();
    for (symbol, _) in DEMO_MARKETS {
        let key = MonitorKey::new(&config.account_id, "sim", *symbol, Timeframe::M1);
        registry.start(
            key.clone(),
            MonitorDeps {
                gateway: gateway.clone(),
                store: store.clone(),
                events: events.clone(),
                dispatcher: dispatcher.clone(),
                rules: config.rules.clone(),
                config: MonitorConfig::default(),
            },
        )?;
        tracing::info!("🔄 Monitor started: {key}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("🛑 Shutdown requested, stopping monitors");
    registry.stop_all().await;

    let open = store.open_positions().await?;
    tracing::info!("👋 TradeBot stopped ({} open positions persisted)", open.len());
    Ok(())
}
