use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Mailer, Notification};
use crate::observability::{NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL};

/// Deliver queued notifications until every `Outbox` handle is dropped.
/// At most once: a failed delivery is logged and forgotten.
pub async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<Notification>, mailer: Arc<dyn Mailer>) {
    while let Some(notification) = rx.recv().await {
        let kind = notification.kind.label();
        match mailer.send(&notification).await {
            Ok(()) => {
                metrics::counter!(NOTIFICATIONS_SENT_TOTAL, "kind" => kind).increment(1);
            }
            Err(e) => {
                metrics::counter!(NOTIFICATIONS_FAILED_TOTAL, "kind" => kind).increment(1);
                tracing::warn!(kind, subject = %notification.subject, "notification not delivered: {e}");
            }
        }
    }
    tracing::debug!("notification dispatcher stopped");
}
