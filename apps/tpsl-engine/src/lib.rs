//! Take-profit / stop-loss monitoring and settlement engine.
//!
//! Watches open leveraged positions against their TP/SL thresholds over
//! two redundant paths: an event-driven fast path (price alerts evaluated
//! on every tick) and a scheduled poll path (per-order jobs re-checking
//! P&L at a fixed interval). Both paths funnel into one settlement
//! service whose atomic status transition makes closes idempotent, so the
//! paths can race freely without double-paying anyone.
//!
//! External collaborators (position store, price feed, notifier) sit
//! behind ports in [`application::ports`]; in-memory adapters live in
//! [`infrastructure`].

pub mod application;
pub mod config;
pub mod domain;
pub mod engine;
pub mod health;
pub mod infrastructure;
pub mod monitor;
pub mod queue;
pub mod settlement;
pub mod telemetry;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{EngineError, EngineEvent, EngineManager};
