//! End-to-end engine tests over the in-memory adapters.
//!
//! Exercises the full component graph: monitor, queue, worker and
//! settlement running together with both trigger paths live.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use tpsl_engine::EngineConfig;
use tpsl_engine::application::ports::PositionStorePort;
use tpsl_engine::domain::{
    AccountId, CloseReason, Direction, OrderId, Position, PositionStatus, Symbol, Timestamp,
    TriggeredBy,
};
use tpsl_engine::engine::{EngineEvent, EngineManager};
use tpsl_engine::infrastructure::{InMemoryPositionStore, MockPriceFeed, RecordingNotifier};
use tpsl_engine::queue::DeadLetterReason;
use tpsl_engine::settlement::SettlementService;

type TestEngine = EngineManager<InMemoryPositionStore, MockPriceFeed, RecordingNotifier>;

struct Harness {
    store: Arc<InMemoryPositionStore>,
    feed: Arc<MockPriceFeed>,
    engine: Arc<TestEngine>,
}

fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(InMemoryPositionStore::new());
    let feed = Arc::new(MockPriceFeed::new());
    let engine = Arc::new(EngineManager::new(
        Arc::clone(&store),
        Arc::clone(&feed),
        Arc::new(RecordingNotifier::new()),
        config,
    ));
    Harness {
        store,
        feed,
        engine,
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poll_interval_ms = 100;
    config.price_wait_ms = 200;
    config.shutdown_grace_ms = 50;
    config.retry.initial_backoff_ms = 5;
    config.retry.max_backoff_ms = 20;
    config.retry.jitter_factor = 0.0;
    config
}

fn long_position(order: &str, take_profit: Option<Decimal>, stop_loss: Option<Decimal>) -> Position {
    Position {
        order_id: OrderId::new(order),
        account_id: AccountId::new("acct-1"),
        symbol: Symbol::new("BTCUSDT"),
        direction: Direction::Long,
        amount: dec!(100),
        leverage: 10,
        open_price: dec!(50000),
        take_profit,
        stop_loss,
        opened_at: Timestamp::now(),
        status: PositionStatus::Open,
    }
}

async fn wait_until_closed(store: &InMemoryPositionStore, order_id: &OrderId) -> bool {
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(Some(position)) = store.get_position(order_id).await
            && !position.is_open()
        {
            return true;
        }
    }
    false
}

#[tokio::test]
async fn fast_path_closes_at_derived_trigger_price() {
    let h = harness_with(fast_config());
    h.store
        .insert_position(long_position("ord-1", Some(dec!(50)), None));
    h.engine.start();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();

    // Exact derived trigger price for tp=50: open * (1 + (50 + 0.5)/1000).
    h.feed.push_tick("BTCUSDT", dec!(52525));

    assert!(wait_until_closed(&h.store, &OrderId::new("ord-1")).await);

    let close = h.store.close_record(&OrderId::new("ord-1")).unwrap();
    assert_eq!(close.reason, CloseReason::TakeProfit);
    assert_eq!(close.triggered_by, TriggeredBy::PriceAlert);
    // Profit at the trigger price is exactly the threshold.
    assert_eq!(close.profit, dec!(50));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn racing_paths_settle_exactly_once() {
    let h = harness_with(fast_config());
    h.store
        .insert_position(long_position("ord-1", Some(dec!(50)), Some(dec!(30))));
    h.engine.start();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();

    // Both paths see the same crossing price: the alert from the tick
    // stream, the poll path from the cached latest price.
    for _ in 0..5 {
        h.feed.push_tick("BTCUSDT", dec!(55000));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    assert!(wait_until_closed(&h.store, &OrderId::new("ord-1")).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Exactly one settlement: one credit of stake + profit.
    assert_eq!(
        h.store.available_balance(&AccountId::new("acct-1")),
        dec!(199.5)
    );
    let stats = h.engine.closure_stats();
    assert_eq!(
        stats.take_profit_closes + stats.stop_loss_closes + stats.manual_closes,
        1
    );

    h.engine.shutdown().await;
}

#[tokio::test]
async fn concurrent_settlements_have_a_single_winner() {
    let store = Arc::new(InMemoryPositionStore::new());
    store.insert_position(long_position("ord-1", Some(dec!(50)), None));
    let settlement = Arc::new(SettlementService::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::new()),
        &EngineConfig::default(),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let settlement = Arc::clone(&settlement);
        handles.push(tokio::spawn(async move {
            settlement
                .close_position(
                    &OrderId::new("ord-1"),
                    dec!(55000),
                    CloseReason::TakeProfit,
                    TriggeredBy::PriceAlert,
                    None,
                )
                .await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap().success {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(
        store.available_balance(&AccountId::new("acct-1")),
        dec!(199.5)
    );
}

#[tokio::test]
async fn remonitoring_keeps_a_single_job() {
    let h = harness_with(fast_config());
    h.store
        .insert_position(long_position("ord-1", Some(dec!(50)), None));

    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();

    assert_eq!(h.engine.monitored_count(), 1);
}

#[tokio::test]
async fn persistent_store_failures_dead_letter_the_job() {
    let mut config = fast_config();
    config.max_consecutive_failures = 3;
    let h = harness_with(config);
    h.store
        .insert_position(long_position("ord-1", Some(dec!(50)), None));
    h.engine.start();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();

    // Every scheduled tick now fails its position read.
    h.store.fail_reads(true);

    let mut dead = Vec::new();
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        dead = h.engine.dead_letters();
        if !dead.is_empty() {
            break;
        }
    }

    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].order_id, OrderId::new("ord-1"));
    assert_eq!(dead[0].reason, DeadLetterReason::RetriesExhausted);
    assert!(!h.engine.is_monitoring(&OrderId::new("ord-1")));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn dead_lettered_order_stops_fast_path_too() {
    let mut config = fast_config();
    config.max_consecutive_failures = 2;
    let h = harness_with(config);
    h.store
        .insert_position(long_position("ord-1", Some(dec!(50)), None));
    h.engine.start();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();

    h.store.fail_reads(true);
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !h.engine.dead_letters().is_empty() {
            break;
        }
    }
    // Alerts were dropped with the job; a later crossing tick must not
    // reach settlement.
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.store.fail_reads(false);
    h.feed.push_tick("BTCUSDT", dec!(55000));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let position = h
        .store
        .get_position(&OrderId::new("ord-1"))
        .await
        .unwrap()
        .unwrap();
    assert!(position.is_open());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn health_reports_dead_letters_and_failures() {
    let mut config = fast_config();
    config.max_consecutive_failures = 2;
    config.health.max_recent_errors = 1;
    let h = harness_with(config);
    h.store
        .insert_position(long_position("ord-1", Some(dec!(50)), None));
    h.engine.start();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();

    h.store.fail_reads(true);
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !h.engine.dead_letters().is_empty() {
            break;
        }
    }

    let health = h.engine.health();
    assert_eq!(health.dead_letters, 1);
    assert!(!health.is_healthy);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn closure_event_carries_settlement_details() {
    let h = harness_with(fast_config());
    h.store
        .insert_position(long_position("ord-1", None, Some(dec!(30))));
    h.engine.start();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();
    let mut events = h.engine.events();

    h.feed.push_tick("BTCUSDT", dec!(48000));
    assert!(wait_until_closed(&h.store, &OrderId::new("ord-1")).await);

    let mut closure = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::OrderClosed(e) = event {
                closure = Some(e);
            }
        }
        if closure.is_some() {
            break;
        }
    }

    let closure = closure.unwrap();
    assert_eq!(closure.order_id, OrderId::new("ord-1"));
    assert_eq!(closure.reason, CloseReason::StopLoss);
    assert_eq!(closure.account_id, AccountId::new("acct-1"));
    assert!(closure.profit < Decimal::ZERO);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn manual_close_coexists_with_monitoring() {
    let h = harness_with(fast_config());
    h.store
        .insert_position(long_position("ord-1", Some(dec!(50)), Some(dec!(30))));
    h.feed.set_price("BTCUSDT", dec!(50100));
    h.engine.start();
    h.engine.monitor_order(&OrderId::new("ord-1")).await.unwrap();

    let result = h
        .engine
        .close_order(&OrderId::new("ord-1"), &AccountId::new("acct-1"))
        .await;
    assert!(result.success);
    assert_eq!(result.reason, Some(CloseReason::Manual));
    // Stake back plus 0.2% on 1000 notional, less 0.5 commission.
    assert_eq!(result.new_balance, Some(dec!(101.5)));

    // Monitoring winds down via the closure event.
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !h.engine.is_monitoring(&OrderId::new("ord-1")) {
            break;
        }
    }
    assert!(!h.engine.is_monitoring(&OrderId::new("ord-1")));

    h.engine.shutdown().await;
}
