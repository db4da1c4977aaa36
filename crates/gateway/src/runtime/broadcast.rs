//! Per-session event fan-out.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::events::SessionEvent;

/// Delivers session events to whoever is listening. Delivery is
/// at-most-once: events sent while nobody is subscribed are dropped.
pub trait EventBroadcaster: Send + Sync {
    fn broadcast_to_session(&self, session_id: &str, event: SessionEvent);

    /// Open a receiver for `session_id`, if this broadcaster supports
    /// in-process subscribers.
    fn subscribe(&self, _session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        None
    }
}

/// [`EventBroadcaster`] on top of one `tokio::sync::broadcast` channel per
/// session, created on first subscription.
pub struct ChannelBroadcaster {
    channels: RwLock<HashMap<String, broadcast::Sender<SessionEvent>>>,
    capacity: usize,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        let mut channels = self.channels.write();
        let tx = channels
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .read()
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the session's channel; open receivers see it close.
    pub fn close(&self, session_id: &str) {
        self.channels.write().remove(session_id);
    }
}

impl EventBroadcaster for ChannelBroadcaster {
    fn broadcast_to_session(&self, session_id: &str, event: SessionEvent) {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(session_id) {
            // No receivers is fine.
            let _ = tx.send(event);
        }
    }

    fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        Some(ChannelBroadcaster::subscribe(self, session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sw_sessions::ChatStatus;

    fn status(id: &str) -> SessionEvent {
        SessionEvent::Status {
            session_id: id.into(),
            chat_status: ChatStatus::Idle,
        }
    }

    #[tokio::test]
    async fn delivers_in_order_to_subscribers() {
        let b = ChannelBroadcaster::new(16);
        let mut rx = b.subscribe("s1");
        b.broadcast_to_session("s1", status("s1"));
        b.broadcast_to_session("s1", SessionEvent::error("s1", "x", "y"));

        assert_eq!(rx.recv().await.unwrap(), status("s1"));
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Error { .. }));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let b = ChannelBroadcaster::new(16);
        let mut rx1 = b.subscribe("s1");
        let _rx2 = b.subscribe("s2");
        b.broadcast_to_session("s2", status("s2"));
        b.broadcast_to_session("s1", status("s1"));
        assert_eq!(rx1.recv().await.unwrap().session_id(), "s1");
        assert_eq!(b.subscriber_count("s2"), 1);
    }

    #[test]
    fn unsubscribed_session_is_dropped_silently() {
        let b = ChannelBroadcaster::new(16);
        b.broadcast_to_session("nobody", status("nobody"));
        assert_eq!(b.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn close_ends_stream() {
        let b = ChannelBroadcaster::new(16);
        let mut rx = b.subscribe("s1");
        b.close("s1");
        assert!(rx.recv().await.is_err());
    }
}
