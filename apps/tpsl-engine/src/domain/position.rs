//! Leveraged position model and price ticks.
//!
//! The position itself is owned by the account store; this engine reads a
//! snapshot of it, evaluates thresholds against live prices and transitions
//! its status exactly once: `Open` -> `Closed`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::identifiers::{AccountId, OrderId};
use super::symbol::Symbol;
use super::timestamp::Timestamp;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Profits when price rises.
    Long,
    /// Profits when price falls.
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Lifecycle status of a position. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Position is open and may be monitored.
    Open,
    /// Position has been settled. No transition out.
    Closed,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Take-profit threshold reached.
    TakeProfit,
    /// Stop-loss threshold reached.
    StopLoss,
    /// Closed by the user, outside this engine.
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit => write!(f, "take_profit"),
            Self::StopLoss => write!(f, "stop_loss"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Which code path detected the crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    /// Event-driven price alert (fast path).
    PriceAlert,
    /// Scheduled monitoring tick (poll path).
    MonitorTick,
    /// External caller (manual close coexisting with monitoring).
    External,
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceAlert => write!(f, "price_alert"),
            Self::MonitorTick => write!(f, "monitor_tick"),
            Self::External => write!(f, "external"),
        }
    }
}

/// An open leveraged position eligible for TP/SL monitoring.
///
/// `take_profit` and `stop_loss` are absolute P&L amounts, not prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Order identifier, unique per position.
    pub order_id: OrderId,
    /// Owning account.
    pub account_id: AccountId,
    /// Market symbol.
    pub symbol: Symbol,
    /// Long or short.
    pub direction: Direction,
    /// Staked amount.
    pub amount: Decimal,
    /// Leverage multiplier applied to the staked amount.
    pub leverage: u32,
    /// Price at which the position was opened.
    pub open_price: Decimal,
    /// Take-profit threshold as an absolute P&L amount.
    pub take_profit: Option<Decimal>,
    /// Stop-loss threshold as an absolute P&L amount.
    pub stop_loss: Option<Decimal>,
    /// When the position was opened.
    pub opened_at: Timestamp,
    /// Current status.
    pub status: PositionStatus,
}

impl Position {
    /// Notional exposure: `amount * leverage`.
    #[must_use]
    pub fn volume(&self) -> Decimal {
        self.amount * Decimal::from(self.leverage)
    }

    /// Whether at least one TP/SL threshold is set.
    #[must_use]
    pub const fn has_thresholds(&self) -> bool {
        self.take_profit.is_some() || self.stop_loss.is_some()
    }

    /// Whether the position is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// A single price update from the external feed. Ephemeral, latest-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Market symbol.
    pub symbol: Symbol,
    /// Authoritative price for the symbol.
    pub price: Decimal,
    /// When the tick was produced.
    pub timestamp: Timestamp,
}

impl PriceTick {
    /// Create a tick stamped with the current time.
    #[must_use]
    pub fn new(symbol: Symbol, price: Decimal) -> Self {
        Self {
            symbol,
            price,
            timestamp: Timestamp::now(),
        }
    }
}
