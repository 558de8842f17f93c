//! TP/SL Engine Binary
//!
//! Runs the engine against the in-memory adapters with a simulated price
//! feed, seeding a few demo positions so the trigger paths are visible in
//! the logs.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin tpsl-engine
//! ```
//!
//! # Environment Variables
//!
//! - `TPSL_CONFIG`: Path to a JSON config file (optional; defaults apply)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use tpsl_engine::EngineConfig;
use tpsl_engine::domain::{
    AccountId, Direction, OrderId, Position, PositionStatus, Symbol, Timestamp,
};
use tpsl_engine::engine::EngineManager;
use tpsl_engine::infrastructure::{InMemoryPositionStore, LogNotifier, MockPriceFeed};
use tpsl_engine::telemetry;

/// How often the simulator publishes a tick per symbol.
const SIMULATOR_TICK_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let config = load_config()?;
    tracing::info!(
        poll_interval_ms = config.poll_interval_ms,
        worker_concurrency = config.worker_concurrency,
        commission_rate = %config.commission_rate,
        "starting tpsl engine"
    );

    let store = Arc::new(InMemoryPositionStore::new());
    let feed = Arc::new(MockPriceFeed::new());
    let notifier = Arc::new(LogNotifier::new());

    let engine = Arc::new(EngineManager::new(
        Arc::clone(&store),
        Arc::clone(&feed),
        notifier,
        config,
    ));
    engine.start();

    let simulator_shutdown = CancellationToken::new();
    start_price_simulator(Arc::clone(&feed), simulator_shutdown.clone());

    for position in demo_positions() {
        let order_id = position.order_id.clone();
        store.insert_position(position);
        if let Err(e) = engine.monitor_order(&order_id).await {
            tracing::warn!(order_id = %order_id, error = %e, "failed to monitor demo position");
        }
    }

    tracing::info!(monitored = engine.monitored_count(), "engine ready");

    shutdown_signal().await;
    simulator_shutdown.cancel();
    engine.shutdown().await;

    let stats = engine.closure_stats();
    tracing::info!(
        take_profit_closes = stats.take_profit_closes,
        stop_loss_closes = stats.stop_loss_closes,
        total_profit = %stats.total_profit,
        "engine stopped"
    );
    Ok(())
}

/// Load configuration from `TPSL_CONFIG` or fall back to defaults.
fn load_config() -> anyhow::Result<EngineConfig> {
    match std::env::var("TPSL_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            let config = serde_json::from_str(&raw)
                .with_context(|| format!("parsing config file {path}"))?;
            tracing::info!(path = %path, "configuration loaded");
            Ok(config)
        }
        Err(_) => Ok(EngineConfig::default()),
    }
}

/// Demo positions exercising both directions and both thresholds.
fn demo_positions() -> Vec<Position> {
    vec![
        Position {
            order_id: OrderId::new("demo-long-btc"),
            account_id: AccountId::new("demo-account"),
            symbol: Symbol::new("BTCUSDT"),
            direction: Direction::Long,
            amount: dec!(100),
            leverage: 10,
            open_price: dec!(50000),
            take_profit: Some(dec!(50)),
            stop_loss: Some(dec!(30)),
            opened_at: Timestamp::now(),
            status: PositionStatus::Open,
        },
        Position {
            order_id: OrderId::new("demo-short-eth"),
            account_id: AccountId::new("demo-account"),
            symbol: Symbol::new("ETHUSDT"),
            direction: Direction::Short,
            amount: dec!(200),
            leverage: 5,
            open_price: dec!(3000),
            take_profit: Some(dec!(40)),
            stop_loss: Some(dec!(25)),
            opened_at: Timestamp::now(),
            status: PositionStatus::Open,
        },
    ]
}

/// Random-walk price simulator publishing ticks for the demo symbols.
fn start_price_simulator(feed: Arc<MockPriceFeed>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut prices = vec![
            ("BTCUSDT", dec!(50000)),
            ("ETHUSDT", dec!(3000)),
        ];
        let mut ticker = tokio::time::interval(SIMULATOR_TICK_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (symbol, price) in &mut prices {
                        // Drift up to +/- 0.2% per tick.
                        let bps: i64 = rand::rng().random_range(-20..=20);
                        *price += *price * Decimal::new(bps, 4);
                        feed.push_tick(symbol, *price);
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    });
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed; an unstoppable process
/// is worse than failing at startup.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
