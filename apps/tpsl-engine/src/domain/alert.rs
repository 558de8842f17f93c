//! Price alerts derived from a position's TP/SL thresholds.
//!
//! Thresholds are absolute P&L amounts; the fast path watches prices, so
//! each threshold is converted into the exact price at which the P&L
//! formula crosses it. Alerts are hints only: settlement re-validates
//! with its own P&L computation before closing anything.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::identifiers::{AccountId, OrderId};
use super::position::{Direction, Position};
use super::symbol::Symbol;

/// Which threshold an alert watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Watching the take-profit threshold.
    TakeProfit,
    /// Watching the stop-loss threshold.
    StopLoss,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit => write!(f, "take_profit"),
            Self::StopLoss => write!(f, "stop_loss"),
        }
    }
}

/// Direction of the price comparison against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceComparison {
    /// Triggers when price >= target.
    Above,
    /// Triggers when price <= target.
    Below,
}

impl PriceComparison {
    /// Whether `price` satisfies the comparison against `target`.
    #[must_use]
    pub fn matches(self, price: Decimal, target: Decimal) -> bool {
        match self {
            Self::Above => price >= target,
            Self::Below => price <= target,
        }
    }
}

/// A registered price alert for one threshold of one position.
///
/// Lifecycle: created when the position enters monitoring, deleted when
/// triggered or when the position leaves monitoring for any reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceAlert {
    /// Market symbol being watched.
    pub symbol: Symbol,
    /// Price at which the alert fires.
    pub target_price: Decimal,
    /// Above or below the target.
    pub comparison: PriceComparison,
    /// Owning order.
    pub order_id: OrderId,
    /// Owning account.
    pub account_id: AccountId,
    /// Which threshold this alert represents.
    pub kind: AlertKind,
}

impl PriceAlert {
    /// Whether a tick price triggers this alert.
    #[must_use]
    pub fn is_triggered_by(&self, price: Decimal) -> bool {
        self.comparison.matches(price, self.target_price)
    }
}

/// Derive the watch prices for a position's thresholds.
///
/// Inverts the P&L formula: take-profit fires once gross profit covers the
/// threshold plus commission, stop-loss once the loss plus commission
/// reaches the threshold. Positions with zero volume or open price produce
/// no alerts.
#[must_use]
pub fn derive_alerts(position: &Position, commission_rate: Decimal) -> Vec<PriceAlert> {
    let volume = position.volume();
    if volume.is_zero() || position.open_price.is_zero() {
        return Vec::new();
    }

    let commission = volume * commission_rate;
    let mut alerts = Vec::with_capacity(2);

    if let Some(tp) = position.take_profit {
        let delta = (tp + commission) / volume;
        let (target_price, comparison) = match position.direction {
            Direction::Long => (
                position.open_price * (Decimal::ONE + delta),
                PriceComparison::Above,
            ),
            Direction::Short => (
                position.open_price * (Decimal::ONE - delta),
                PriceComparison::Below,
            ),
        };
        alerts.push(PriceAlert {
            symbol: position.symbol.clone(),
            target_price,
            comparison,
            order_id: position.order_id.clone(),
            account_id: position.account_id.clone(),
            kind: AlertKind::TakeProfit,
        });
    }

    if let Some(sl) = position.stop_loss {
        // Commission eats into the loss budget, so the price trigger sits
        // closer to the open than the raw threshold would suggest.
        let delta = ((sl.abs() - commission) / volume).max(Decimal::ZERO);
        let (target_price, comparison) = match position.direction {
            Direction::Long => (
                position.open_price * (Decimal::ONE - delta),
                PriceComparison::Below,
            ),
            Direction::Short => (
                position.open_price * (Decimal::ONE + delta),
                PriceComparison::Above,
            ),
        };
        alerts.push(PriceAlert {
            symbol: position.symbol.clone(),
            target_price,
            comparison,
            order_id: position.order_id.clone(),
            account_id: position.account_id.clone(),
            kind: AlertKind::StopLoss,
        });
    }

    alerts
}
