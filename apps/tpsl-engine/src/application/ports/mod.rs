//! Ports: interfaces for the external collaborators the engine consumes.

mod notifier;
mod position_store;
mod price_feed;

pub use notifier::{Notification, NotificationKind, NotifierPort, NotifyError};
pub use position_store::{PositionClose, PositionStorePort, StoreError};
pub use price_feed::{FeedError, PriceFeedPort};
