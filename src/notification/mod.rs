//! Post-commit outbox for email notifications.
//!
//! Mutations enqueue after their WAL record is durable; a dispatcher task
//! hands each notification to a [`Mailer`] once. Delivery problems are logged
//! and counted, never reported back to the write that caused them.

mod dispatch;
mod mailer;
pub mod templates;

pub use dispatch::run_dispatcher;
pub use mailer::{LogMailer, Mailer, NotificationDeliveryError};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::Person;
use crate::observability::{NOTIFICATIONS_DROPPED_TOTAL, NOTIFICATIONS_ENQUEUED_TOTAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AssignmentFinalized,
    AssignmentAdded,
    AssignmentRemoved,
    FirstLogin,
}

impl NotificationKind {
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::AssignmentFinalized => "assignment_finalized",
            NotificationKind::AssignmentAdded => "assignment_added",
            NotificationKind::AssignmentRemoved => "assignment_removed",
            NotificationKind::FirstLogin => "first_login",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub recipients: Vec<String>,
}

/// Addresses of the active persons with a valid email, deduplicated.
pub fn recipients<'a>(persons: impl IntoIterator<Item = &'a Person>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for p in persons {
        if p.is_deliverable() && !out.iter().any(|e| e.eq_ignore_ascii_case(&p.email)) {
            out.push(p.email.clone());
        }
    }
    out
}

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue for delivery. Never fails; a notification nobody can receive is dropped.
    pub fn enqueue(&self, notification: Notification) {
        let kind = notification.kind.label();
        if notification.recipients.is_empty() {
            tracing::debug!(kind, "notification has no deliverable recipients, skipped");
            return;
        }
        metrics::counter!(NOTIFICATIONS_ENQUEUED_TOTAL, "kind" => kind).increment(1);
        if self.tx.send(notification).is_err() {
            metrics::counter!(NOTIFICATIONS_DROPPED_TOTAL, "kind" => kind).increment(1);
            tracing::warn!(kind, "notification dropped: dispatcher is not running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AdminType, SpecialRole};
    use ulid::Ulid;

    fn person(email: &str, active: bool) -> Person {
        Person {
            id: Ulid::new(),
            username: "x".into(),
            email: email.into(),
            first_name: "Anna".into(),
            last_name: "Kiss".into(),
            phone: None,
            admin_type: AdminType::None,
            special_role: SpecialRole::None,
            active,
            class_id: None,
            team_id: None,
            radio_team_id: None,
        }
    }

    fn note(recipients: Vec<String>) -> Notification {
        Notification {
            kind: NotificationKind::FirstLogin,
            subject: "s".into(),
            text: "t".into(),
            html: "h".into(),
            recipients,
        }
    }

    #[test]
    fn recipients_skip_inactive_and_invalid_and_duplicates() {
        let people = [
            person("a@school.hu", true),
            person("b@school.hu", false),
            person("not-an-email", true),
            person("A@School.hu", true),
        ];
        assert_eq!(recipients(&people), vec!["a@school.hu".to_string()]);
    }

    #[tokio::test]
    async fn enqueue_delivers_to_channel() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.enqueue(note(vec!["a@school.hu".into()]));
        assert_eq!(rx.recv().await.unwrap().recipients, vec!["a@school.hu"]);
    }

    #[test]
    fn empty_recipient_list_is_not_queued() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.enqueue(note(vec![]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn enqueue_after_dispatcher_stopped_does_not_panic() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        outbox.enqueue(note(vec!["a@school.hu".into()]));
    }
}
