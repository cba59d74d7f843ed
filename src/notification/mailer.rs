use async_trait::async_trait;

use super::Notification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDeliveryError {
    pub recipients: Vec<String>,
    pub reason: String,
}

impl std::fmt::Display for NotificationDeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "delivery to {} recipient(s) failed: {}",
            self.recipients.len(),
            self.reason
        )
    }
}

impl std::error::Error for NotificationDeliveryError {}

/// Outbound email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationDeliveryError>;
}

/// Writes every message to the log instead of an SMTP relay.
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationDeliveryError> {
        tracing::info!(
            from = %self.from,
            to = ?notification.recipients,
            kind = notification.kind.label(),
            subject = %notification.subject,
            "email"
        );
        tracing::debug!(body = %notification.text, "email body");
        Ok(())
    }
}
