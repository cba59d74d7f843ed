use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Change feed: committed events fanned out per subject id.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, subject_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(subject_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, subject_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&subject_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose listeners have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AbsenceStatus;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let subject = Ulid::new();
        let mut rx = hub.subscribe(subject);

        let event = Event::AbsenceReviewed {
            id: Ulid::new(),
            status: AbsenceStatus::Approved,
        };
        hub.send(subject, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_subjects_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let mut rx = hub.subscribe(mine);
        hub.send(Ulid::new(), &Event::BookingCancelled { id: Ulid::new() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(Ulid::new(), &Event::BookingCancelled { id: Ulid::new() });
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(Ulid::new());
        let _kept = hub.subscribe(Ulid::new());
        drop(rx);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
    }
}
