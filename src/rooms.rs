//! Local pub/sub room broadcaster
//!
//! Rooms are keyed by `<graph>:<recipient>`. Subscribers attach through a
//! bounded channel; a slow or dropped subscriber is pruned on the next
//! broadcast rather than blocking the sender.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-subscriber outbound buffer depth
const SUBSCRIBER_QUEUE_CAP: usize = 256;

struct Subscriber {
    id: u64,
    tx: Sender<String>,
}

/// Room registry with channel-based fanout
#[derive(Clone)]
pub struct RoomBroadcaster {
    rooms: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    next_id: Arc<AtomicU64>,
}

impl RoomBroadcaster {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Room key for a recipient within a graph (graph defaults to "personal")
    pub fn topic_key(graph: &str, recipient: &str) -> String {
        let graph = if graph.is_empty() { "personal" } else { graph };
        format!("{}:{}", graph.to_lowercase(), recipient)
    }

    /// Join a room; returns the subscriber id and the message stream
    pub fn join(&self, key: &str) -> (u64, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_QUEUE_CAP);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rooms
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Remove a subscriber from every room
    pub fn leave(&self, id: u64) {
        let mut rooms = self.rooms.lock();
        for subs in rooms.values_mut() {
            subs.retain(|s| s.id != id);
        }
        rooms.retain(|_, subs| !subs.is_empty());
    }

    /// Serialize `value` once and send it to every live subscriber of `key`.
    ///
    /// Returns the number of subscribers reached. Disconnected subscribers
    /// are dropped; a full subscriber queue drops this message for that
    /// subscriber only.
    pub fn broadcast(&self, key: &str, value: &serde_json::Value) -> usize {
        let data = value.to_string();
        let mut rooms = self.rooms.lock();
        let Some(subs) = rooms.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|s| match s.tx.try_send(data.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::debug!("rooms: subscriber {} on {:?} is backed up, dropping message", s.id, key);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        if subs.is_empty() {
            rooms.remove(key);
        }
        delivered
    }

    /// Number of subscribers currently in a room
    pub fn room_len(&self, key: &str) -> usize {
        self.rooms.lock().get(key).map_or(0, |s| s.len())
    }
}

impl Default for RoomBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_key() {
        assert_eq!(RoomBroadcaster::topic_key("Personal", "alice"), "personal:alice");
        assert_eq!(RoomBroadcaster::topic_key("", "alice"), "personal:alice");
        assert_eq!(RoomBroadcaster::topic_key("work", "bob"), "work:bob");
    }

    #[test]
    fn test_join_broadcast_receive() {
        let rooms = RoomBroadcaster::new();
        let (_id, rx) = rooms.join("personal:alice");

        let delivered = rooms.broadcast("personal:alice", &json!({"type": "capsule", "n": 1}));
        assert_eq!(delivered, 1);

        let msg = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["type"], "capsule");
    }

    #[test]
    fn test_broadcast_misses_other_rooms() {
        let rooms = RoomBroadcaster::new();
        let (_id, rx) = rooms.join("personal:alice");
        assert_eq!(rooms.broadcast("personal:bob", &json!({})), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let rooms = RoomBroadcaster::new();
        let (_id, rx) = rooms.join("personal:alice");
        drop(rx);

        assert_eq!(rooms.broadcast("personal:alice", &json!({})), 0);
        assert_eq!(rooms.room_len("personal:alice"), 0);
    }

    #[test]
    fn test_leave_removes_from_all_rooms() {
        let rooms = RoomBroadcaster::new();
        let (id, _rx) = rooms.join("personal:alice");
        let (id2, rx2) = rooms.join("personal:alice");
        assert_ne!(id, id2);

        rooms.leave(id);
        assert_eq!(rooms.room_len("personal:alice"), 1);
        assert_eq!(rooms.broadcast("personal:alice", &json!({"x": 1})), 1);
        assert!(rx2.try_recv().is_ok());
    }
}
