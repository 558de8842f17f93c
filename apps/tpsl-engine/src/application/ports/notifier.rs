//! Notification Port (Driven Port)
//!
//! User-facing notification sink. Delivery failures are logged by the
//! caller and never block or fail a closure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::AccountId;

/// Category of a user notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Position closed with a profit.
    ProfitClose,
    /// Position closed with a loss.
    LossClose,
    /// Monitoring problem the user should know about.
    MonitoringIssue,
}

/// A user-facing notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Receiving account.
    pub account_id: AccountId,
    /// Category.
    pub kind: NotificationKind,
    /// Short headline.
    pub title: String,
    /// Full message body.
    pub message: String,
}

/// Notification delivery error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("notification delivery failed: {message}")]
pub struct NotifyError {
    /// Error details.
    pub message: String,
}

/// Port for delivering user notifications.
#[async_trait]
pub trait NotifierPort: Send + Sync {
    /// Deliver a notification. Best effort.
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}
