//! Position Store Port (Driven Port)
//!
//! Interface to the authoritative order/account store. The engine never
//! owns positions; it reads them, transitions their status exactly once
//! and applies the resulting balance mutation through this port.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{AccountId, CloseReason, OrderId, Position, Timestamp, TriggeredBy};

/// Everything the store needs to persist a close transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClose {
    /// Price at which the position was closed.
    pub close_price: Decimal,
    /// Final profit after commission (may be negative).
    pub profit: Decimal,
    /// Why the position was closed.
    pub reason: CloseReason,
    /// Which path detected the crossing.
    pub triggered_by: TriggeredBy,
    /// When the close was decided.
    pub closed_at: Timestamp,
}

/// Position store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Position does not exist.
    #[error("position not found: {order_id}")]
    NotFound {
        /// The missing order ID.
        order_id: OrderId,
    },

    /// Position was already closed; the transition is terminal.
    #[error("position already closed: {order_id}")]
    AlreadyClosed {
        /// The already-closed order ID.
        order_id: OrderId,
    },

    /// Store timed out; safe to retry on the next scheduled tick.
    #[error("store timeout: {message}")]
    Timeout {
        /// Error details.
        message: String,
    },

    /// Backend failure.
    #[error("store backend error: {message}")]
    Backend {
        /// Error details.
        message: String,
    },
}

impl StoreError {
    /// Whether the error is transient and worth retrying later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Backend { .. })
    }
}

/// Port for the authoritative position/account store.
#[async_trait]
pub trait PositionStorePort: Send + Sync {
    /// Load a position by order ID, regardless of status.
    ///
    /// Callers decide how to treat a closed position: the worker cancels
    /// its job silently, settlement reports `AlreadyClosed`.
    async fn get_position(&self, order_id: &OrderId) -> Result<Option<Position>, StoreError>;

    /// Transition a position from open to closed.
    ///
    /// Must be atomic: if the position is not open at the time of the
    /// write, the store returns [`StoreError::AlreadyClosed`] and leaves
    /// it untouched. This check-and-set is what makes settlement
    /// idempotent under racing trigger paths.
    async fn set_closed(&self, order_id: &OrderId, close: &PositionClose)
    -> Result<(), StoreError>;

    /// Credit (or debit, with a negative delta) the account's available
    /// balance. Returns the resulting balance.
    async fn adjust_available_balance(
        &self,
        account_id: &AccountId,
        delta: Decimal,
    ) -> Result<Decimal, StoreError>;

    /// Update the account's trading statistics after a closure.
    async fn record_trade_stats(
        &self,
        account_id: &AccountId,
        profit: Decimal,
        volume: Decimal,
    ) -> Result<(), StoreError>;
}
