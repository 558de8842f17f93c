//! In-memory price feed adapter.
//!
//! Publishes ticks on a broadcast channel and answers pull-style lookups
//! from a latest-wins map. Used by the bundled binary's simulator and by
//! the test suites.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::application::ports::{FeedError, PriceFeedPort};
use crate::domain::{PriceTick, Symbol};

/// In-memory [`PriceFeedPort`] adapter with fault injection.
pub struct MockPriceFeed {
    prices: Mutex<HashMap<Symbol, PriceTick>>,
    subscriptions: Mutex<HashSet<Symbol>>,
    tick_tx: broadcast::Sender<PriceTick>,
    fail_subscriptions: AtomicBool,
    fail_lookups: AtomicBool,
}

impl Default for MockPriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPriceFeed {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        let (tick_tx, _) = broadcast::channel(1024);
        Self {
            prices: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            tick_tx,
            fail_subscriptions: AtomicBool::new(false),
            fail_lookups: AtomicBool::new(false),
        }
    }

    /// Set the latest price for a symbol without publishing a tick.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let symbol = Symbol::new(symbol);
        self.prices
            .lock()
            .insert(symbol.clone(), PriceTick::new(symbol, price));
    }

    /// Set the latest price and publish it on the tick stream.
    pub fn push_tick(&self, symbol: &str, price: Decimal) {
        let tick = PriceTick::new(Symbol::new(symbol), price);
        self.prices.lock().insert(tick.symbol.clone(), tick.clone());
        let _ = self.tick_tx.send(tick);
    }

    /// Symbols currently subscribed.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Symbol> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Whether a symbol is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscriptions.lock().contains(&Symbol::new(symbol))
    }

    /// Toggle failure injection on subscribe/unsubscribe.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.fail_subscriptions.store(fail, Ordering::SeqCst);
    }

    /// Toggle failure injection on pull-style lookups.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PriceFeedPort for MockPriceFeed {
    async fn subscribe(&self, symbol: &Symbol) -> Result<(), FeedError> {
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(FeedError::SubscriptionError {
                message: "injected subscription failure".to_string(),
            });
        }
        self.subscriptions.lock().insert(symbol.clone());
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &Symbol) -> Result<(), FeedError> {
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(FeedError::SubscriptionError {
                message: "injected subscription failure".to_string(),
            });
        }
        self.subscriptions.lock().remove(symbol);
        Ok(())
    }

    async fn get_latest(&self, symbol: &Symbol) -> Result<Option<PriceTick>, FeedError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(FeedError::Timeout);
        }
        Ok(self.prices.lock().get(symbol).cloned())
    }

    fn ticks(&self) -> broadcast::Receiver<PriceTick> {
        self.tick_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn subscribe_and_lookup() {
        let feed = MockPriceFeed::new();
        let symbol = Symbol::new("BTCUSDT");

        assert_ok!(feed.subscribe(&symbol).await);
        assert!(feed.is_subscribed("BTCUSDT"));

        feed.set_price("BTCUSDT", dec!(50000));
        let tick = assert_ok!(feed.get_latest(&symbol).await).unwrap();
        assert_eq!(tick.price, dec!(50000));
    }

    #[tokio::test]
    async fn push_tick_reaches_subscribers() {
        let feed = MockPriceFeed::new();
        let mut ticks = feed.ticks();

        feed.push_tick("BTCUSDT", dec!(51000));

        let tick = ticks.recv().await.unwrap();
        assert_eq!(tick.symbol, Symbol::new("BTCUSDT"));
        assert_eq!(tick.price, dec!(51000));
    }

    #[tokio::test]
    async fn injected_lookup_failure() {
        let feed = MockPriceFeed::new();
        feed.fail_lookups(true);

        let err = assert_err!(feed.get_latest(&Symbol::new("BTCUSDT")).await);
        assert!(err.is_transient());

        feed.fail_subscriptions(true);
        assert_err!(feed.subscribe(&Symbol::new("BTCUSDT")).await);
    }
}
