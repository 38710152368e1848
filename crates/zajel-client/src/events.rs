//! Client event bus (`spec.md` §4.3): the five observable streams
//! (`peers_changed`, `messages`, `file_events`, `pair_requests`,
//! `key_change_events`) are all fed from one broadcast channel and
//! distinguished by [`zajel_types::events::EventType`]; callers filter
//! the kind of event they want off a shared subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use zajel_types::events::{Event, EventType};

/// Subscribers whose receive buffer falls this far behind start losing
/// events (oldest first); matches the teacher's daemon-wide default.
const DEFAULT_CAPACITY: usize = 1000;

/// Event bus for broadcasting connection-manager events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, sequence: Arc::new(AtomicU64::new(0)) }
    }

    /// Emit an event to all current subscribers. Silently dropped if
    /// nobody is listening.
    pub fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = Event { event_type, timestamp: now(), payload };
        let _ = self.sender.send(event);
    }

    /// Subscribe to the full event stream. Callers interested in only
    /// one of the five observable streams filter on `event_type`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Which of the five observable streams (`spec.md` §4.3) an event
/// belongs to.
pub fn stream_of(event_type: &EventType) -> &'static str {
    match event_type {
        EventType::PeerAdded | EventType::PeerRemoved | EventType::PeerStateChanged => "peers_changed",
        EventType::MessageReceived => "messages",
        EventType::FileTransferStarted
        | EventType::FileTransferProgress
        | EventType::FileTransferComplete
        | EventType::FileTransferFailed
        | EventType::FileTransferCancelled => "file_events",
        EventType::PairRequestReceived
        | EventType::PairRequestAccepted
        | EventType::PairRequestRejected
        | EventType::PairRequestTimedOut => "pair_requests",
        EventType::KeyChanged => "key_change_events",
        EventType::SignalingConnected | EventType::SignalingDisconnected | EventType::SignalingReconnecting => {
            "signaling"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EventType::PeerAdded, serde_json::json!({"peer_id": "abc"}));

        let event = rx.try_recv().expect("receive event");
        assert_eq!(event.event_type, EventType::PeerAdded);
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn stream_of_groups_events_correctly() {
        assert_eq!(stream_of(&EventType::PeerAdded), "peers_changed");
        assert_eq!(stream_of(&EventType::MessageReceived), "messages");
        assert_eq!(stream_of(&EventType::FileTransferComplete), "file_events");
        assert_eq!(stream_of(&EventType::PairRequestReceived), "pair_requests");
        assert_eq!(stream_of(&EventType::KeyChanged), "key_change_events");
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit(EventType::SignalingConnected, serde_json::json!({}));
        assert_eq!(bus.sequence(), 1);
    }
}
