//! Price monitoring service.
//!
//! Single source of "current price" for monitored symbols and the
//! fast-path trigger mechanism. Ingests ticks from the feed, keeps a
//! latest-wins cache per symbol and evaluates registered alerts inside
//! the tick handler; no I/O happens on that hot path beyond cache and
//! registry lookups.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{FeedError, PriceFeedPort};
use crate::config::EngineConfig;
use crate::domain::{AlertKind, OrderId, PriceAlert, PriceTick, Symbol, Timestamp};
use crate::health::ComponentHealth;

/// How often the bounded price wait re-checks the cache.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A fired alert, published on the fast path.
///
/// Consumers treat this as a hint: the authoritative close still goes
/// through settlement's own validation.
#[derive(Debug, Clone)]
pub struct AlertTrigger {
    /// The alert that fired (already removed from the registry).
    pub alert: PriceAlert,
    /// The tick price that satisfied the comparison.
    pub price: Decimal,
    /// Timestamp of the triggering tick.
    pub tick_time: Timestamp,
}

/// Price monitor service: latest-price cache plus alert registry.
pub struct PriceMonitorService<F: PriceFeedPort> {
    feed: Arc<F>,
    cache: RwLock<HashMap<Symbol, PriceTick>>,
    alerts: RwLock<HashMap<OrderId, Vec<PriceAlert>>>,
    tracked: RwLock<HashSet<Symbol>>,
    last_tick_at: Mutex<Option<Instant>>,
    failed_fetches: AtomicU32,
    stale_window: Duration,
    max_failed_fetches: u32,
    trigger_tx: broadcast::Sender<AlertTrigger>,
}

impl<F: PriceFeedPort + 'static> PriceMonitorService<F> {
    /// Create a new price monitor backed by `feed`.
    #[must_use]
    pub fn new(feed: Arc<F>, config: &EngineConfig) -> Self {
        let (trigger_tx, _) = broadcast::channel(256);
        Self {
            feed,
            cache: RwLock::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            tracked: RwLock::new(HashSet::new()),
            last_tick_at: Mutex::new(None),
            failed_fetches: AtomicU32::new(0),
            stale_window: config.price_stale_window(),
            max_failed_fetches: config.max_failed_fetches,
            trigger_tx,
        }
    }

    /// Start consuming the feed's tick stream until `shutdown` fires.
    pub fn start_ingest(self: &Arc<Self>, shutdown: CancellationToken) {
        let monitor = Arc::clone(self);
        let mut ticks = self.feed.ticks();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = ticks.recv() => {
                        match result {
                            Ok(tick) => monitor.on_price_tick(&tick),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "tick ingest lagged, skipped {} ticks", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                info!("tick stream closed");
                                break;
                            }
                        }
                    }
                    () = shutdown.cancelled() => {
                        info!("price monitor shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Idempotently subscribe to the feed for a symbol.
    pub async fn add_symbol(&self, symbol: &Symbol) -> Result<(), FeedError> {
        if self.tracked.read().contains(symbol) {
            return Ok(());
        }
        self.feed.subscribe(symbol).await?;
        self.tracked.write().insert(symbol.clone());
        debug!(symbol = %symbol, "tracking symbol");
        Ok(())
    }

    /// Unsubscribe and drop cached state for a symbol.
    ///
    /// No-op while any registered alert still references the symbol.
    pub async fn remove_symbol(&self, symbol: &Symbol) -> Result<(), FeedError> {
        let still_referenced = self
            .alerts
            .read()
            .values()
            .flatten()
            .any(|a| &a.symbol == symbol);
        if still_referenced {
            return Ok(());
        }

        let was_tracked = self.tracked.write().remove(symbol);
        if was_tracked {
            self.feed.unsubscribe(symbol).await?;
            self.cache.write().remove(symbol);
            debug!(symbol = %symbol, "dropped symbol");
        }
        Ok(())
    }

    /// Register an alert, replacing any prior alert for the same order
    /// and threshold kind.
    pub fn add_alert(&self, alert: PriceAlert) {
        let mut alerts = self.alerts.write();
        let entry = alerts.entry(alert.order_id.clone()).or_default();
        entry.retain(|a| a.kind != alert.kind);
        entry.push(alert);
    }

    /// Remove alerts by order id, optionally scoped to one symbol.
    ///
    /// Returns the number of alerts removed. Idempotent.
    pub fn remove_alerts(&self, order_id: &OrderId, symbol: Option<&Symbol>) -> usize {
        let mut alerts = self.alerts.write();
        let Some(entry) = alerts.get_mut(order_id) else {
            return 0;
        };

        let before = entry.len();
        match symbol {
            Some(symbol) => entry.retain(|a| &a.symbol != symbol),
            None => entry.clear(),
        }
        let removed = before - entry.len();

        if entry.is_empty() {
            alerts.remove(order_id);
        }
        removed
    }

    /// Handle one price tick: update the cache and evaluate every alert
    /// registered on the tick's symbol. Triggered alerts are removed and
    /// published as [`AlertTrigger`] events.
    pub fn on_price_tick(&self, tick: &PriceTick) {
        self.cache.write().insert(tick.symbol.clone(), tick.clone());
        *self.last_tick_at.lock() = Some(Instant::now());

        let triggered: Vec<PriceAlert> = {
            let mut alerts = self.alerts.write();
            let mut fired = Vec::new();
            for entry in alerts.values_mut() {
                let (hit, kept): (Vec<PriceAlert>, Vec<PriceAlert>) = entry
                    .drain(..)
                    .partition(|a| a.symbol == tick.symbol && a.is_triggered_by(tick.price));
                *entry = kept;
                fired.extend(hit);
            }
            alerts.retain(|_, entry| !entry.is_empty());
            fired
        };

        for alert in triggered {
            info!(
                order_id = %alert.order_id,
                symbol = %alert.symbol,
                kind = %alert.kind,
                target = %alert.target_price,
                price = %tick.price,
                "price alert triggered"
            );
            let _ = self.trigger_tx.send(AlertTrigger {
                alert,
                price: tick.price,
                tick_time: tick.timestamp,
            });
        }
    }

    /// Latest cached tick for a symbol.
    #[must_use]
    pub fn latest_price(&self, symbol: &Symbol) -> Option<PriceTick> {
        self.cache.read().get(symbol).cloned()
    }

    /// Wait up to `timeout` for a price, polling the cache and pulling
    /// from the feed. Returns `None` on timeout; callers skip the tick
    /// and let the schedule retry.
    pub async fn wait_for_price(&self, symbol: &Symbol, timeout: Duration) -> Option<PriceTick> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(tick) = self.latest_price(symbol) {
                return Some(tick);
            }

            match self.feed.get_latest(symbol).await {
                Ok(Some(tick)) => {
                    self.on_price_tick(&tick);
                    return Some(tick);
                }
                Ok(None) => {}
                Err(e) => {
                    self.record_failed_fetch();
                    debug!(symbol = %symbol, error = %e, "price fetch failed");
                }
            }

            if Instant::now() + WAIT_POLL_INTERVAL > deadline {
                return None;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Bump the rolling failed-fetch counter.
    pub fn record_failed_fetch(&self) {
        self.failed_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Current failed-fetch count.
    #[must_use]
    pub fn failed_fetches(&self) -> u32 {
        self.failed_fetches.load(Ordering::Relaxed)
    }

    /// Subscribe to fast-path trigger events.
    #[must_use]
    pub fn triggers(&self) -> broadcast::Receiver<AlertTrigger> {
        self.trigger_tx.subscribe()
    }

    /// Number of registered alerts across all orders.
    #[must_use]
    pub fn alert_count(&self) -> usize {
        self.alerts.read().values().map(Vec::len).sum()
    }

    /// Whether an order has any pending alert, optionally of one kind.
    #[must_use]
    pub fn has_alert(&self, order_id: &OrderId, kind: Option<AlertKind>) -> bool {
        self.alerts.read().get(order_id).is_some_and(|entry| {
            kind.map_or(!entry.is_empty(), |k| entry.iter().any(|a| a.kind == k))
        })
    }

    /// Symbols currently tracked.
    #[must_use]
    pub fn tracked_symbols(&self) -> Vec<Symbol> {
        self.tracked.read().iter().cloned().collect()
    }

    /// Component health: stale ticks or excessive failed fetches make
    /// the monitor unhealthy. An idle monitor (no tracked symbols) is
    /// healthy by definition.
    #[must_use]
    pub fn health(&self) -> ComponentHealth {
        let mut issues = Vec::new();

        if !self.tracked.read().is_empty() {
            let stale = self
                .last_tick_at
                .lock()
                .map_or(true, |at| at.elapsed() > self.stale_window);
            if stale {
                issues.push("price_cache_stale".to_string());
            }
        }

        if self.failed_fetches() > self.max_failed_fetches {
            issues.push("excessive_failed_fetches".to_string());
        }

        if issues.is_empty() {
            ComponentHealth::healthy("price_monitor")
        } else {
            ComponentHealth::unhealthy("price_monitor", issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, PriceComparison};
    use crate::infrastructure::feed::MockPriceFeed;
    use rust_decimal_macros::dec;

    fn make_monitor() -> (Arc<MockPriceFeed>, PriceMonitorService<MockPriceFeed>) {
        let feed = Arc::new(MockPriceFeed::new());
        let monitor = PriceMonitorService::new(Arc::clone(&feed), &EngineConfig::default());
        (feed, monitor)
    }

    fn make_alert(order: &str, target: Decimal, comparison: PriceComparison) -> PriceAlert {
        PriceAlert {
            symbol: Symbol::new("BTCUSDT"),
            target_price: target,
            comparison,
            order_id: OrderId::new(order),
            account_id: AccountId::new("acct-1"),
            kind: AlertKind::TakeProfit,
        }
    }

    #[tokio::test]
    async fn add_symbol_is_idempotent() {
        let (feed, monitor) = make_monitor();

        monitor.add_symbol(&Symbol::new("BTCUSDT")).await.unwrap();
        monitor.add_symbol(&Symbol::new("BTCUSDT")).await.unwrap();

        assert_eq!(feed.subscriptions().len(), 1);
        assert_eq!(monitor.tracked_symbols().len(), 1);
    }

    #[tokio::test]
    async fn remove_symbol_keeps_subscription_while_alerts_reference_it() {
        let (feed, monitor) = make_monitor();
        let symbol = Symbol::new("BTCUSDT");

        monitor.add_symbol(&symbol).await.unwrap();
        monitor.add_alert(make_alert("ord-1", dec!(51000), PriceComparison::Above));

        monitor.remove_symbol(&symbol).await.unwrap();
        assert!(feed.is_subscribed("BTCUSDT"));

        monitor.remove_alerts(&OrderId::new("ord-1"), None);
        monitor.remove_symbol(&symbol).await.unwrap();
        assert!(!feed.is_subscribed("BTCUSDT"));
    }

    #[test]
    fn add_alert_replaces_same_kind() {
        let (_feed, monitor) = make_monitor();

        monitor.add_alert(make_alert("ord-1", dec!(51000), PriceComparison::Above));
        monitor.add_alert(make_alert("ord-1", dec!(52000), PriceComparison::Above));

        assert_eq!(monitor.alert_count(), 1);
    }

    #[test]
    fn tick_triggers_above_alert_and_removes_it() {
        let (_feed, monitor) = make_monitor();
        let mut triggers = monitor.triggers();

        monitor.add_alert(make_alert("ord-1", dec!(51000), PriceComparison::Above));

        monitor.on_price_tick(&PriceTick::new(Symbol::new("BTCUSDT"), dec!(51500)));

        let event = triggers.try_recv().unwrap();
        assert_eq!(event.alert.order_id, OrderId::new("ord-1"));
        assert_eq!(event.price, dec!(51500));
        assert_eq!(monitor.alert_count(), 0);
    }

    #[test]
    fn tick_below_target_leaves_alert_pending() {
        let (_feed, monitor) = make_monitor();
        let mut triggers = monitor.triggers();

        monitor.add_alert(make_alert("ord-1", dec!(51000), PriceComparison::Above));
        monitor.on_price_tick(&PriceTick::new(Symbol::new("BTCUSDT"), dec!(50500)));

        assert!(triggers.try_recv().is_err());
        assert_eq!(monitor.alert_count(), 1);
    }

    #[test]
    fn below_alert_triggers_at_or_under_target() {
        let (_feed, monitor) = make_monitor();
        let mut triggers = monitor.triggers();

        monitor.add_alert(make_alert("ord-1", dec!(49000), PriceComparison::Below));
        monitor.on_price_tick(&PriceTick::new(Symbol::new("BTCUSDT"), dec!(49000)));

        assert!(triggers.try_recv().is_ok());
    }

    #[test]
    fn tick_updates_cache_latest_wins() {
        let (_feed, monitor) = make_monitor();
        let symbol = Symbol::new("BTCUSDT");

        monitor.on_price_tick(&PriceTick::new(symbol.clone(), dec!(50000)));
        monitor.on_price_tick(&PriceTick::new(symbol.clone(), dec!(50100)));

        assert_eq!(monitor.latest_price(&symbol).unwrap().price, dec!(50100));
    }

    #[tokio::test]
    async fn wait_for_price_pulls_from_feed() {
        let (feed, monitor) = make_monitor();
        feed.set_price("BTCUSDT", dec!(42000));

        let tick = monitor
            .wait_for_price(&Symbol::new("BTCUSDT"), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(tick.price, dec!(42000));
    }

    #[tokio::test]
    async fn wait_for_price_times_out_without_data() {
        let (_feed, monitor) = make_monitor();

        let tick = monitor
            .wait_for_price(&Symbol::new("BTCUSDT"), Duration::from_millis(150))
            .await;
        assert!(tick.is_none());
    }

    #[test]
    fn remove_alerts_is_idempotent() {
        let (_feed, monitor) = make_monitor();
        monitor.add_alert(make_alert("ord-1", dec!(51000), PriceComparison::Above));

        assert_eq!(monitor.remove_alerts(&OrderId::new("ord-1"), None), 1);
        assert_eq!(monitor.remove_alerts(&OrderId::new("ord-1"), None), 0);
    }

    #[test]
    fn health_is_ok_when_idle() {
        let (_feed, monitor) = make_monitor();
        assert!(monitor.health().is_healthy);
    }

    #[tokio::test]
    async fn health_reports_stale_cache_when_tracking() {
        let (_feed, monitor) = make_monitor();
        monitor.add_symbol(&Symbol::new("BTCUSDT")).await.unwrap();

        // Tracking a symbol but no tick has ever arrived.
        let health = monitor.health();
        assert!(!health.is_healthy);
        assert!(health.issues.contains(&"price_cache_stale".to_string()));
    }

    #[test]
    fn health_reports_excessive_failed_fetches() {
        let (_feed, monitor) = make_monitor();
        for _ in 0..=EngineConfig::default().max_failed_fetches {
            monitor.record_failed_fetch();
        }
        let health = monitor.health();
        assert!(!health.is_healthy);
        assert!(
            health
                .issues
                .contains(&"excessive_failed_fetches".to_string())
        );
    }
}
