//! Profit-and-loss arithmetic.
//!
//! P&L is a pure function of (open price, close price, direction, amount,
//! leverage) plus a fixed commission rate. No hidden state: two evaluations
//! with identical inputs always agree, which is what makes settlement safe
//! to re-run from either trigger path.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::{CloseReason, Direction};

/// Default commission rate applied to notional volume (0.05%).
pub const DEFAULT_COMMISSION_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 4);

/// Full P&L breakdown for a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlBreakdown {
    /// Notional exposure: `amount * leverage`.
    pub volume: Decimal,
    /// Relative price move: `(close - open) / open`.
    pub price_change: Decimal,
    /// Direction-signed profit before commission.
    pub gross_profit: Decimal,
    /// Commission charged on notional volume.
    pub commission: Decimal,
    /// `gross_profit - commission`.
    pub final_profit: Decimal,
    /// `final_profit / amount * 100`.
    pub profit_pct: Decimal,
}

/// Compute the P&L breakdown for closing a position at `close_price`.
///
/// A zero `open_price` or `amount` yields a zero-change breakdown rather
/// than dividing; positions with such values are rejected before they
/// ever enter monitoring.
#[must_use]
pub fn compute(
    direction: Direction,
    amount: Decimal,
    leverage: u32,
    open_price: Decimal,
    close_price: Decimal,
    commission_rate: Decimal,
) -> PnlBreakdown {
    let volume = amount * Decimal::from(leverage);

    let price_change = if open_price.is_zero() {
        Decimal::ZERO
    } else {
        (close_price - open_price) / open_price
    };

    let gross_profit = match direction {
        Direction::Long => volume * price_change,
        Direction::Short => volume * -price_change,
    };

    let commission = volume * commission_rate;
    let final_profit = gross_profit - commission;

    let profit_pct = if amount.is_zero() {
        Decimal::ZERO
    } else {
        final_profit / amount * Decimal::ONE_HUNDRED
    };

    PnlBreakdown {
        volume,
        price_change,
        gross_profit,
        commission,
        final_profit,
        profit_pct,
    }
}

/// Decide whether `final_profit` crosses a TP/SL threshold.
///
/// Take-profit fires when `final_profit >= take_profit`; stop-loss fires
/// when `final_profit <= -|stop_loss|`. Stop-loss is checked first
/// (pessimistic) in the degenerate case where both would hold.
#[must_use]
pub fn evaluate_crossing(
    final_profit: Decimal,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
) -> Option<CloseReason> {
    if let Some(sl) = stop_loss {
        if final_profit <= -sl.abs() {
            return Some(CloseReason::StopLoss);
        }
    }

    if let Some(tp) = take_profit {
        if final_profit >= tp {
            return Some(CloseReason::TakeProfit);
        }
    }

    None
}
