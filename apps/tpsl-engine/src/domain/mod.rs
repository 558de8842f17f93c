//! Core business types and pure functions. No I/O, no async.

pub mod alert;
pub mod identifiers;
pub mod pnl;
pub mod position;
pub mod symbol;
pub mod timestamp;

pub use alert::{AlertKind, PriceAlert, PriceComparison, derive_alerts};
pub use identifiers::{AccountId, OrderId};
pub use pnl::{DEFAULT_COMMISSION_RATE, PnlBreakdown};
pub use position::{CloseReason, Direction, Position, PositionStatus, PriceTick, TriggeredBy};
pub use symbol::Symbol;
pub use timestamp::Timestamp;
