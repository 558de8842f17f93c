//! Scheduled monitoring worker.
//!
//! Executes one poll-path tick per job: re-read the position, re-read the
//! price, recompute P&L and hand any crossing to settlement. The worker
//! never mutates positions itself; it only decides what the queue should
//! do with the job next.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::application::ports::{NotifierPort, PositionStorePort, PriceFeedPort};
use crate::config::EngineConfig;
use crate::domain::{TriggeredBy, pnl};
use crate::health::{ComponentHealth, RollingStats, RollingTracker};
use crate::monitor::PriceMonitorService;
use crate::queue::{DeadLetterReason, JobHandler, JobOutcome, MonitoringJob};
use crate::settlement::{CloseErrorCode, SettlementService};

/// How a tick counts against the rolling health window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickReport {
    Success,
    Skipped,
    Failure,
}

/// Poll-path worker: one instance serves every scheduled job.
pub struct OrderMonitorWorker<S, F, N>
where
    S: PositionStorePort,
    F: PriceFeedPort,
    N: NotifierPort,
{
    store: Arc<S>,
    monitor: Arc<PriceMonitorService<F>>,
    settlement: Arc<SettlementService<S, N>>,
    price_wait: Duration,
    tracker: Mutex<RollingTracker>,
}

impl<S, F, N> OrderMonitorWorker<S, F, N>
where
    S: PositionStorePort,
    F: PriceFeedPort + 'static,
    N: NotifierPort + 'static,
{
    /// Create a worker over the shared engine collaborators.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        monitor: Arc<PriceMonitorService<F>>,
        settlement: Arc<SettlementService<S, N>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            settlement,
            price_wait: config.price_wait(),
            tracker: Mutex::new(RollingTracker::new(config.health.window())),
        }
    }

    /// Rolling tick statistics.
    #[must_use]
    pub fn stats(&self) -> RollingStats {
        self.tracker.lock().snapshot()
    }

    /// Worker health against the rolling window.
    #[must_use]
    pub fn health(&self, min_success_rate: f64, max_recent_errors: u64) -> ComponentHealth {
        let tracker = self.tracker.lock();
        let mut issues = Vec::new();
        if tracker.success_rate() < min_success_rate {
            issues.push("low_tick_success_rate".to_string());
        }
        if tracker.recent_errors() > max_recent_errors {
            issues.push("excessive_tick_errors".to_string());
        }
        drop(tracker);

        if issues.is_empty() {
            ComponentHealth::healthy("order_worker")
        } else {
            ComponentHealth::unhealthy("order_worker", issues)
        }
    }

    async fn run_tick(&self, job: &MonitoringJob) -> (JobOutcome, TickReport) {
        let position = match self.store.get_position(&job.order_id).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                warn!(order_id = %job.order_id, "monitored position vanished from store");
                return (
                    JobOutcome::DeadLetter(DeadLetterReason::OrderVanished),
                    TickReport::Failure,
                );
            }
            Err(e) => {
                warn!(order_id = %job.order_id, error = %e, "position read failed");
                return (JobOutcome::Retry, TickReport::Failure);
            }
        };

        if !position.is_open() {
            // Closed elsewhere (fast path or manual); nothing left to watch.
            debug!(order_id = %job.order_id, "position closed externally, finishing job");
            return (JobOutcome::Completed, TickReport::Success);
        }

        if !position.has_thresholds() {
            return (
                JobOutcome::DeadLetter(DeadLetterReason::NoThresholds),
                TickReport::Failure,
            );
        }

        let Some(tick) = self
            .monitor
            .wait_for_price(&job.symbol, self.price_wait)
            .await
        else {
            // No price is a skip, not a failure; the schedule retries.
            debug!(order_id = %job.order_id, symbol = %job.symbol, "no price for tick");
            return (JobOutcome::Retry, TickReport::Skipped);
        };

        let breakdown = pnl::compute(
            position.direction,
            position.amount,
            position.leverage,
            position.open_price,
            tick.price,
            self.settlement.commission_rate(),
        );

        let Some(reason) = pnl::evaluate_crossing(
            breakdown.final_profit,
            position.take_profit,
            position.stop_loss,
        ) else {
            return (JobOutcome::Reschedule, TickReport::Success);
        };

        debug!(
            order_id = %job.order_id,
            reason = %reason,
            price = %tick.price,
            profit = %breakdown.final_profit,
            "threshold crossed on scheduled tick"
        );

        let result = self
            .settlement
            .close_position(
                &job.order_id,
                tick.price,
                reason,
                TriggeredBy::MonitorTick,
                None,
            )
            .await;

        if result.success {
            return (JobOutcome::Completed, TickReport::Success);
        }

        match result.error {
            // Someone else settled it; monitoring is done either way.
            Some(CloseErrorCode::AlreadyClosed) => (JobOutcome::Completed, TickReport::Success),
            Some(CloseErrorCode::NotFound) => (
                JobOutcome::DeadLetter(DeadLetterReason::OrderVanished),
                TickReport::Failure,
            ),
            Some(CloseErrorCode::NoThresholds) => (
                JobOutcome::DeadLetter(DeadLetterReason::NoThresholds),
                TickReport::Failure,
            ),
            _ => (JobOutcome::Retry, TickReport::Failure),
        }
    }
}

#[async_trait]
impl<S, F, N> JobHandler for OrderMonitorWorker<S, F, N>
where
    S: PositionStorePort,
    F: PriceFeedPort + 'static,
    N: NotifierPort + 'static,
{
    async fn execute(&self, job: &MonitoringJob) -> JobOutcome {
        let started = Instant::now();
        let (outcome, report) = self.run_tick(job).await;

        match report {
            TickReport::Success => self.tracker.lock().record_success(started.elapsed()),
            TickReport::Skipped => self.tracker.lock().record_skip(),
            TickReport::Failure => self.tracker.lock().record_failure(),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AccountId, Direction, OrderId, Position, PositionStatus, PriceTick, Symbol, Timestamp,
    };
    use crate::infrastructure::feed::MockPriceFeed;
    use crate::infrastructure::notifier::RecordingNotifier;
    use crate::infrastructure::store::InMemoryPositionStore;
    use rust_decimal_macros::dec;

    type TestWorker = OrderMonitorWorker<InMemoryPositionStore, MockPriceFeed, RecordingNotifier>;

    struct Fixture {
        store: Arc<InMemoryPositionStore>,
        monitor: Arc<PriceMonitorService<MockPriceFeed>>,
        worker: TestWorker,
    }

    fn make_fixture() -> Fixture {
        let mut config = EngineConfig::default();
        config.price_wait_ms = 200;

        let store = Arc::new(InMemoryPositionStore::new());
        let feed = Arc::new(MockPriceFeed::new());
        let monitor = Arc::new(PriceMonitorService::new(Arc::clone(&feed), &config));
        let settlement = Arc::new(SettlementService::new(
            Arc::clone(&store),
            Arc::new(RecordingNotifier::new()),
            &config,
        ));
        let worker = OrderMonitorWorker::new(
            Arc::clone(&store),
            Arc::clone(&monitor),
            settlement,
            &config,
        );
        Fixture {
            store,
            monitor,
            worker,
        }
    }

    fn make_position(order: &str) -> Position {
        Position {
            order_id: OrderId::new(order),
            account_id: AccountId::new("acct-1"),
            symbol: Symbol::new("BTCUSDT"),
            direction: Direction::Long,
            amount: dec!(100),
            leverage: 10,
            open_price: dec!(50000),
            take_profit: Some(dec!(50)),
            stop_loss: Some(dec!(30)),
            opened_at: Timestamp::now(),
            status: PositionStatus::Open,
        }
    }

    fn job_for(position: &Position) -> MonitoringJob {
        MonitoringJob::for_position(position)
    }

    #[tokio::test]
    async fn tick_without_crossing_reschedules() {
        let fx = make_fixture();
        let position = make_position("ord-1");
        fx.store.insert_position(position.clone());
        fx.monitor
            .on_price_tick(&PriceTick::new(Symbol::new("BTCUSDT"), dec!(50250)));

        let outcome = fx.worker.execute(&job_for(&position)).await;
        assert_eq!(outcome, JobOutcome::Reschedule);

        let stored = fx
            .store
            .get_position(&position.order_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_open());
    }

    #[tokio::test]
    async fn tick_crossing_take_profit_settles_and_completes() {
        let fx = make_fixture();
        let position = make_position("ord-1");
        fx.store.insert_position(position.clone());
        fx.monitor
            .on_price_tick(&PriceTick::new(Symbol::new("BTCUSDT"), dec!(55000)));

        let outcome = fx.worker.execute(&job_for(&position)).await;
        assert_eq!(outcome, JobOutcome::Completed);

        let stored = fx
            .store
            .get_position(&position.order_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_open());
    }

    #[tokio::test]
    async fn tick_crossing_stop_loss_settles() {
        let fx = make_fixture();
        let position = make_position("ord-1");
        fx.store.insert_position(position.clone());
        // 48000: gross -40, final -40.5, past the -30 stop.
        fx.monitor
            .on_price_tick(&PriceTick::new(Symbol::new("BTCUSDT"), dec!(48000)));

        let outcome = fx.worker.execute(&job_for(&position)).await;
        assert_eq!(outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn vanished_position_is_dead_lettered() {
        let fx = make_fixture();
        let position = make_position("ord-1");

        let outcome = fx.worker.execute(&job_for(&position)).await;
        assert_eq!(
            outcome,
            JobOutcome::DeadLetter(DeadLetterReason::OrderVanished)
        );
    }

    #[tokio::test]
    async fn externally_closed_position_completes_silently() {
        let fx = make_fixture();
        let mut position = make_position("ord-1");
        position.status = PositionStatus::Closed;
        fx.store.insert_position(position.clone());

        let outcome = fx.worker.execute(&job_for(&position)).await;
        assert_eq!(outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn thresholdless_position_is_dead_lettered() {
        let fx = make_fixture();
        let mut position = make_position("ord-1");
        position.take_profit = None;
        position.stop_loss = None;
        fx.store.insert_position(position.clone());

        let outcome = fx.worker.execute(&job_for(&position)).await;
        assert_eq!(
            outcome,
            JobOutcome::DeadLetter(DeadLetterReason::NoThresholds)
        );
    }

    #[tokio::test]
    async fn missing_price_retries_as_a_skip() {
        let fx = make_fixture();
        let position = make_position("ord-1");
        fx.store.insert_position(position.clone());

        let outcome = fx.worker.execute(&job_for(&position)).await;
        assert_eq!(outcome, JobOutcome::Retry);

        // A price-wait miss is reported as a skip, not a failure.
        let stats = fx.worker.stats();
        assert_eq!(stats.recent_skips, 1);
        assert_eq!(stats.recent_errors, 0);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
        assert!(fx.worker.health(0.95, 25).is_healthy);
    }

    #[tokio::test]
    async fn store_read_failure_retries() {
        let fx = make_fixture();
        let position = make_position("ord-1");
        fx.store.insert_position(position.clone());
        fx.store.fail_reads(true);

        let outcome = fx.worker.execute(&job_for(&position)).await;
        assert_eq!(outcome, JobOutcome::Retry);
    }

    #[tokio::test]
    async fn health_degrades_with_failures() {
        let fx = make_fixture();
        let position = make_position("ord-1");
        // No position in store: every tick dead-letters, counted as failure.
        for _ in 0..5 {
            let _ = fx.worker.execute(&job_for(&position)).await;
        }

        let health = fx.worker.health(0.95, 25);
        assert!(!health.is_healthy);
        assert!(
            health
                .issues
                .contains(&"low_tick_success_rate".to_string())
        );
    }
}
