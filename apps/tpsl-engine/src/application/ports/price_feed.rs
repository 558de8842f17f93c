//! Price Feed Port (Driven Port)
//!
//! Interface for the live market-price feed. The feed owns the single
//! authoritative price per symbol; the engine subscribes per symbol and
//! consumes an asynchronous tick stream plus a pull-style latest lookup.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{PriceTick, Symbol};

/// Price feed error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    /// Connection error.
    #[error("price feed connection error: {message}")]
    ConnectionError {
        /// Error details.
        message: String,
    },

    /// Symbol is not known to the feed.
    #[error("symbol not found: {symbol}")]
    SymbolNotFound {
        /// The unknown symbol.
        symbol: Symbol,
    },

    /// Subscription request failed.
    #[error("subscription error: {message}")]
    SubscriptionError {
        /// Error details.
        message: String,
    },

    /// Feed did not answer in time; retry on the next tick.
    #[error("price feed timeout")]
    Timeout,
}

impl FeedError {
    /// Whether the error is transient and worth retrying later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionError { .. } | Self::Timeout)
    }
}

/// Port for the external market-price feed.
#[async_trait]
pub trait PriceFeedPort: Send + Sync {
    /// Subscribe to ticks for a symbol. Idempotent.
    async fn subscribe(&self, symbol: &Symbol) -> Result<(), FeedError>;

    /// Unsubscribe from a symbol.
    async fn unsubscribe(&self, symbol: &Symbol) -> Result<(), FeedError>;

    /// Pull the latest known tick for a symbol, if the feed has one.
    async fn get_latest(&self, symbol: &Symbol) -> Result<Option<PriceTick>, FeedError>;

    /// Subscribe to the asynchronous tick publish stream.
    ///
    /// Ticks for all subscribed symbols are fanned out on this channel;
    /// slow consumers may lag and miss ticks, which is acceptable because
    /// the poll path re-reads the latest price on every scheduled check.
    fn ticks(&self) -> broadcast::Receiver<PriceTick>;
}
