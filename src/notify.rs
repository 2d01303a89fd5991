use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking notifications, one channel per teacher.
///
/// Delivery is fire-and-forget: a full or unsubscribed channel never fails
/// the booking that produced the event. External delivery (email, push) is
/// expected to hang off a subscriber.
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

    /// Subscribe to notifications for a teacher. Creates the channel if needed.
    pub fn subscribe(&self, teacher_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(teacher_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, teacher_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&teacher_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a teacher is offboarded).
    #[allow(dead_code)]
    pub fn remove(&self, teacher_id: &Ulid) {
        self.channels.remove(teacher_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BookingPolicy;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let tid = Ulid::new();
        let mut rx = hub.subscribe(tid);

        let event = Event::TeacherRegistered {
            id: tid,
            policy: BookingPolicy::default(),
        };
        hub.send(tid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let tid = Ulid::new();
        // No subscriber — should not panic
        hub.send(
            tid,
            &Event::PaymentCaptured {
                teacher_id: tid,
                group_id: Ulid::new(),
            },
        );
    }
}
