//! Notification adapters.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::application::ports::{Notification, NotifierPort, NotifyError};

/// Notifier that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LogNotifier {
    /// Create a log notifier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotifierPort for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            account_id = %notification.account_id,
            kind = ?notification.kind,
            title = %notification.title,
            message = %notification.message,
            "notification"
        );
        Ok(())
    }
}

/// Notifier that records deliveries for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: Mutex<bool>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Toggle delivery failure.
    pub fn fail_deliveries(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl NotifierPort for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        if *self.fail.lock() {
            return Err(NotifyError {
                message: "injected delivery failure".to_string(),
            });
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::NotificationKind;
    use crate::domain::AccountId;

    fn make_notification() -> Notification {
        Notification {
            account_id: AccountId::new("acct-1"),
            kind: NotificationKind::ProfitClose,
            title: "BTCUSDT position closed".to_string(),
            message: "ord-1 closed at 55000".to_string(),
        }
    }

    #[tokio::test]
    async fn recorder_captures_notifications() {
        let notifier = RecordingNotifier::new();
        notifier.notify(make_notification()).await.unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::ProfitClose);
    }

    #[tokio::test]
    async fn recorder_failure_injection() {
        let notifier = RecordingNotifier::new();
        notifier.fail_deliveries(true);

        assert!(notifier.notify(make_notification()).await.is_err());
        assert!(notifier.sent().is_empty());
    }
}
