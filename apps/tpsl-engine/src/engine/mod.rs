//! Engine manager.
//!
//! Owns the component graph and the background tasks: the tick ingest,
//! the fast-path trigger consumer, the scheduler and the health loop.
//! Callers interact only with this type; components never call back into
//! it, they publish events the manager's tasks consume.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::ports::{
    FeedError, NotifierPort, PositionStorePort, PriceFeedPort, StoreError,
};
use crate::config::EngineConfig;
use crate::domain::{AccountId, AlertKind, CloseReason, OrderId, TriggeredBy, derive_alerts};
use crate::health::SystemHealth;
use crate::monitor::{AlertTrigger, PriceMonitorService};
use crate::queue::{DeadLetterEntry, EnqueueOutcome, MonitoringJob, QueueEvent, WorkQueue};
use crate::settlement::{
    CloseErrorCode, ClosureEvent, ClosureResult, ClosureStats, SettlementService,
};
use crate::worker::OrderMonitorWorker;

/// Error starting or changing monitoring.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No position with that order ID.
    #[error("position not found: {order_id}")]
    NotFound {
        /// The missing order ID.
        order_id: OrderId,
    },

    /// Position exists but is not open.
    #[error("position is not open: {order_id}")]
    NotOpen {
        /// The closed order ID.
        order_id: OrderId,
    },

    /// Position carries neither threshold; there is nothing to watch.
    #[error("position has no thresholds: {order_id}")]
    NoThresholds {
        /// The thresholdless order ID.
        order_id: OrderId,
    },

    /// Price feed refused the subscription.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Store failure while reading the position.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Engine lifecycle and settlement events.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An order entered monitoring.
    MonitoringStarted(OrderId),
    /// An order left monitoring without a settlement here.
    MonitoringStopped(OrderId),
    /// A position was settled.
    OrderClosed(ClosureEvent),
    /// A fast-path trigger failed to settle.
    ClosureError {
        /// Order the close was for.
        order_id: OrderId,
        /// Human-readable failure detail.
        detail: String,
    },
    /// The periodic health check found the engine unhealthy.
    HealthCheckFailed(SystemHealth),
}

/// Top-level engine: wires the monitor, queue, worker and settlement.
pub struct EngineManager<S, F, N>
where
    S: PositionStorePort + 'static,
    F: PriceFeedPort + 'static,
    N: NotifierPort + 'static,
{
    config: EngineConfig,
    store: Arc<S>,
    monitor: Arc<PriceMonitorService<F>>,
    settlement: Arc<SettlementService<S, N>>,
    worker: Arc<OrderMonitorWorker<S, F, N>>,
    queue: Arc<WorkQueue<OrderMonitorWorker<S, F, N>>>,
    shutdown: CancellationToken,
    event_tx: broadcast::Sender<EngineEvent>,
    started: AtomicBool,
}

impl<S, F, N> EngineManager<S, F, N>
where
    S: PositionStorePort + 'static,
    F: PriceFeedPort + 'static,
    N: NotifierPort + 'static,
{
    /// Build the component graph. Nothing runs until [`Self::start`].
    #[must_use]
    pub fn new(store: Arc<S>, feed: Arc<F>, notifier: Arc<N>, config: EngineConfig) -> Self {
        let monitor = Arc::new(PriceMonitorService::new(feed, &config));
        let settlement = Arc::new(SettlementService::new(
            Arc::clone(&store),
            notifier,
            &config,
        ));
        let worker = Arc::new(OrderMonitorWorker::new(
            Arc::clone(&store),
            Arc::clone(&monitor),
            Arc::clone(&settlement),
            &config,
        ));
        let queue = Arc::new(WorkQueue::new(Arc::clone(&worker), &config));
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            store,
            monitor,
            settlement,
            worker,
            queue,
            shutdown: CancellationToken::new(),
            event_tx,
            started: AtomicBool::new(false),
        }
    }

    /// Start the background tasks. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            worker_concurrency = self.config.worker_concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "engine starting"
        );

        self.monitor.start_ingest(self.shutdown.clone());
        tokio::spawn(Arc::clone(&self.queue).run(self.shutdown.clone()));
        self.spawn_trigger_consumer();
        self.spawn_closure_consumer();
        self.spawn_queue_event_consumer();
        self.spawn_health_loop();
    }

    /// Subscribe to engine events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Put an open position under TP/SL monitoring.
    ///
    /// Registers fast-path alerts for each threshold and schedules the
    /// poll-path job. Re-monitoring an already-monitored order only
    /// refreshes the alerts; the existing job is kept.
    pub async fn monitor_order(&self, order_id: &OrderId) -> Result<(), EngineError> {
        let position = self
            .store
            .get_position(order_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                order_id: order_id.clone(),
            })?;

        if !position.is_open() {
            return Err(EngineError::NotOpen {
                order_id: order_id.clone(),
            });
        }
        if !position.has_thresholds() {
            return Err(EngineError::NoThresholds {
                order_id: order_id.clone(),
            });
        }

        self.monitor.add_symbol(&position.symbol).await?;
        for alert in derive_alerts(&position, self.config.commission_rate) {
            self.monitor.add_alert(alert);
        }
        if self.queue.enqueue(MonitoringJob::for_position(&position)) == EnqueueOutcome::Duplicate {
            debug!(order_id = %order_id, "order already queued, keeping existing job");
        }

        info!(
            order_id = %order_id,
            symbol = %position.symbol,
            take_profit = ?position.take_profit,
            stop_loss = ?position.stop_loss,
            "order under monitoring"
        );
        let _ = self
            .event_tx
            .send(EngineEvent::MonitoringStarted(order_id.clone()));
        Ok(())
    }

    /// Stop monitoring an order without closing it. Idempotent.
    pub async fn stop_monitoring(&self, order_id: &OrderId) {
        let had_job = self.queue.remove(order_id);
        let removed_alerts = self.monitor.remove_alerts(order_id, None);
        if had_job || removed_alerts > 0 {
            info!(order_id = %order_id, "monitoring stopped");
            let _ = self
                .event_tx
                .send(EngineEvent::MonitoringStopped(order_id.clone()));
        }
    }

    /// Close an order on behalf of its owner at the current price.
    ///
    /// The ownership check runs inside settlement; monitoring cleanup
    /// rides on the closure event like any other close.
    pub async fn close_order(&self, order_id: &OrderId, account_id: &AccountId) -> ClosureResult {
        let position = match self.store.get_position(order_id).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                return ClosureResult::refused(order_id.clone(), CloseErrorCode::NotFound);
            }
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "position lookup failed");
                return ClosureResult::refused(order_id.clone(), CloseErrorCode::StoreError);
            }
        };

        let Some(tick) = self
            .monitor
            .wait_for_price(&position.symbol, self.config.price_wait())
            .await
        else {
            return ClosureResult::refused(order_id.clone(), CloseErrorCode::PriceUnavailable);
        };

        self.settlement
            .close_position(
                order_id,
                tick.price,
                CloseReason::Manual,
                TriggeredBy::External,
                Some(account_id),
            )
            .await
    }

    /// Whether an order is currently monitored.
    #[must_use]
    pub fn is_monitoring(&self, order_id: &OrderId) -> bool {
        self.queue.contains(order_id) || self.monitor.has_alert(order_id, None)
    }

    /// Orders currently scheduled.
    #[must_use]
    pub fn monitored_count(&self) -> usize {
        self.queue.len()
    }

    /// Dead-lettered jobs, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.queue.dead_letters()
    }

    /// Settlement counters.
    #[must_use]
    pub fn closure_stats(&self) -> ClosureStats {
        self.settlement.stats()
    }

    /// Aggregate health across every component.
    #[must_use]
    pub fn health(&self) -> SystemHealth {
        let thresholds = &self.config.health;
        let components = vec![
            self.monitor.health(),
            self.queue.health(),
            self.worker
                .health(thresholds.min_success_rate, thresholds.max_recent_errors),
            self.settlement.health(),
        ];

        let settlement = self.settlement.stats().rolling;
        let worker = self.worker.stats();

        let is_healthy = components.iter().all(|c| c.is_healthy)
            && settlement.success_rate >= thresholds.min_success_rate
            && settlement.recent_errors <= thresholds.max_recent_errors;

        SystemHealth {
            is_healthy,
            components,
            success_rate: settlement.success_rate,
            recent_errors: settlement.recent_errors,
            avg_latency_ms: settlement.avg_latency_ms,
            ticks_processed: worker.total_processed,
            monitored_orders: self.queue.len(),
            dead_letters: self.queue.dead_letter_count(),
        }
    }

    /// Graceful shutdown: stop the tasks, then wait the configured grace
    /// period for in-flight settlements to finish.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.shutdown.cancel();
        tokio::time::sleep(self.config.shutdown_grace()).await;
        info!(
            monitored = self.queue.len(),
            dead_letters = self.queue.dead_letter_count(),
            "engine stopped"
        );
    }

    /// Immediate stop: cancel everything, drop nothing-in-particular.
    /// In-flight settlements may still complete; no new work starts.
    pub fn emergency_stop(&self) {
        warn!("emergency stop");
        self.shutdown.cancel();
    }

    fn spawn_trigger_consumer(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut triggers = self.monitor.triggers();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = triggers.recv() => match result {
                        Ok(trigger) => engine.settle_trigger(trigger).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "trigger consumer lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    async fn settle_trigger(&self, trigger: AlertTrigger) {
        let reason = match trigger.alert.kind {
            AlertKind::TakeProfit => CloseReason::TakeProfit,
            AlertKind::StopLoss => CloseReason::StopLoss,
        };

        let result = self
            .settlement
            .close_position(
                &trigger.alert.order_id,
                trigger.price,
                reason,
                TriggeredBy::PriceAlert,
                None,
            )
            .await;

        if !result.success {
            // AlreadyClosed is the poll path winning the race; everything
            // else deserves a visible error.
            if let Some(code) = result.error
                && code != CloseErrorCode::AlreadyClosed
            {
                error!(
                    order_id = %trigger.alert.order_id,
                    code = %code,
                    "fast-path close failed"
                );
                let _ = self.event_tx.send(EngineEvent::ClosureError {
                    order_id: trigger.alert.order_id.clone(),
                    detail: code.to_string(),
                });
            }
        }
    }

    fn spawn_closure_consumer(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut closures = self.settlement.closures();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = closures.recv() => match result {
                        Ok(event) => {
                            engine.queue.remove(&event.order_id);
                            engine.monitor.remove_alerts(&event.order_id, None);
                            // A job can outlive its alerts (a trigger that
                            // failed to settle transiently consumes them), so
                            // the queue is checked too before unsubscribing.
                            if engine.queue.symbol_referenced(&event.symbol) {
                                debug!(symbol = %event.symbol, "symbol still watched by a scheduled job");
                            } else if let Err(e) = engine.monitor.remove_symbol(&event.symbol).await {
                                warn!(symbol = %event.symbol, error = %e, "symbol cleanup failed");
                            }
                            let _ = engine.event_tx.send(EngineEvent::OrderClosed(event));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "closure consumer lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    fn spawn_queue_event_consumer(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut events = self.queue.events();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = events.recv() => match result {
                        Ok(QueueEvent::JobExpired(order_id)
                            | QueueEvent::JobDeadLettered(order_id, _)) => {
                            // Job is gone; drop the fast path with it.
                            engine.monitor.remove_alerts(&order_id, None);
                            let _ = engine
                                .event_tx
                                .send(EngineEvent::MonitoringStopped(order_id));
                        }
                        Ok(QueueEvent::JobCompleted(_)) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "queue event consumer lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.health.check_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pending = engine.settlement.retry_pending_credits().await;
                        if pending > 0 {
                            warn!(pending, "balance credits still unpaid");
                        }

                        let health = engine.health();
                        if !health.is_healthy {
                            warn!(
                                success_rate = health.success_rate,
                                recent_errors = health.recent_errors,
                                dead_letters = health.dead_letters,
                                "health check failed"
                            );
                            let _ = engine
                                .event_tx
                                .send(EngineEvent::HealthCheckFailed(health));
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }
}
