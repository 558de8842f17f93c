//! Infrastructure adapters for the engine's ports.
//!
//! In-memory implementations: the store and feed here back the bundled
//! binary and the test suites. Production deployments supply their own
//! adapters against the same ports.

pub mod feed;
pub mod notifier;
pub mod store;

pub use feed::MockPriceFeed;
pub use notifier::{LogNotifier, RecordingNotifier};
pub use store::{InMemoryPositionStore, TradeStats};
