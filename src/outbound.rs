//! Outbound fragmentation and pacing
//!
//! Payloads are sliced into MTU-sized frames at enqueue time and parked in
//! `pending`. A pacing step moves at most one frame per invocation from
//! `pending` to `in_flight`, where the driver registry picks frames up.
//! Enqueue paths may take one immediate step, but only while `in_flight` is
//! idle; the steady-state release rate belongs to the pacer thread.

use crate::band::BandProfile;
use crate::frame;
use std::collections::{HashMap, VecDeque};

/// Outbound frame queues and per-topic sequencing
pub struct Outbound {
    profile: BandProfile,
    seq_by_topic: HashMap<String, u32>,
    /// Frames waiting for a pacing slot
    pending: VecDeque<Vec<u8>>,
    /// Frames released toward the drivers
    in_flight: VecDeque<Vec<u8>>,
}

impl Outbound {
    pub fn new(profile: BandProfile) -> Self {
        Self {
            profile,
            seq_by_topic: HashMap::new(),
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
        }
    }

    /// Next sequence number for a topic (starts at 1, never reused)
    fn next_seq(&mut self, topic: &str) -> u32 {
        let entry = self.seq_by_topic.entry(topic.to_string()).or_insert(0);
        *entry = entry.wrapping_add(1);
        *entry
    }

    /// Fragment a payload into frames and append them to the pending queue.
    ///
    /// Returns the number of frames queued. Empty payloads are a no-op; a
    /// topic/codec pair whose header leaves no room on the active profile is
    /// dropped with a warning.
    pub fn enqueue(&mut self, topic: &str, payload: &[u8], codec: &str, ts_ms: u64) -> usize {
        if payload.is_empty() {
            return 0;
        }
        let max_payload = frame::max_payload_bytes(self.profile.mtu, topic, codec);
        if max_payload == 0 {
            log::warn!(
                "outbound: MTU {} too small for topic {:?} codec {:?}, dropping {} bytes",
                self.profile.mtu,
                topic,
                codec,
                payload.len()
            );
            return 0;
        }

        let mut queued = 0;
        for chunk in payload.chunks(max_payload) {
            let seq = self.next_seq(topic);
            match frame::encode_frame(topic, seq, ts_ms, codec, chunk) {
                Ok(encoded) => {
                    self.pending.push_back(encoded);
                    queued += 1;
                }
                Err(e) => {
                    // Only reachable with a >255-byte topic/codec; drop the lot
                    log::warn!("outbound: cannot encode frame for {:?}: {}", topic, e);
                    return queued;
                }
            }
        }
        queued
    }

    /// Move at most one frame from pending to in-flight.
    ///
    /// Returns true when a frame moved.
    pub fn kick(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(frame) => {
                self.in_flight.push_back(frame);
                true
            }
            None => false,
        }
    }

    /// Take a pacing step only while nothing is in flight.
    ///
    /// This is the enqueue-path kick: small traffic gets an immediate first
    /// frame, but a busy link stays at the pacer's rate.
    pub fn kick_if_idle(&mut self) -> bool {
        if self.in_flight.is_empty() {
            self.kick()
        } else {
            false
        }
    }

    /// Pop the next in-flight frame for delivery
    pub fn pop_in_flight(&mut self) -> Option<Vec<u8>> {
        self.in_flight.pop_front()
    }

    /// Return an undeliverable frame to the head of the in-flight queue
    pub fn requeue_in_flight(&mut self, frame: Vec<u8>) {
        self.in_flight.push_front(frame);
    }

    /// Frames awaiting a pacing slot
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Frames released but not yet accepted by a driver
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Active band profile
    pub fn profile(&self) -> BandProfile {
        self.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_frame;

    fn outbound() -> Outbound {
        Outbound::new(BandProfile { mtu: 180, rate_hz: 10.0 })
    }

    #[test]
    fn test_empty_payload_is_noop() {
        let mut ob = outbound();
        assert_eq!(ob.enqueue("personal:alice", &[], "", 0), 0);
        assert_eq!(ob.pending_len(), 0);
    }

    #[test]
    fn test_fragmentation_500_bytes_at_mtu_180() {
        let mut ob = outbound();
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let max_payload = frame::max_payload_bytes(180, "personal:alice", "");
        let expected = payload.len().div_ceil(max_payload);

        let queued = ob.enqueue("personal:alice", &payload, "", 99);
        assert_eq!(queued, expected);
        assert_eq!(ob.pending_len(), expected);

        // Drain everything and check seq, MTU bound, and reassembly
        let mut reassembled = Vec::new();
        let mut expected_seq = 1u32;
        while ob.kick() {
            let encoded = ob.pop_in_flight().unwrap();
            assert!(encoded.len() <= 180, "frame exceeds MTU: {}", encoded.len());
            let frame = decode_frame(&encoded).unwrap();
            assert_eq!(frame.seq, expected_seq);
            assert_eq!(frame.topic, "personal:alice");
            reassembled.extend_from_slice(&frame.payload);
            expected_seq += 1;
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_mtu_too_small_drops() {
        let mut ob = Outbound::new(BandProfile { mtu: 10, rate_hz: 10.0 });
        assert_eq!(ob.enqueue("personal:alice", b"data", "audio/opus", 0), 0);
        assert_eq!(ob.pending_len(), 0);
    }

    #[test]
    fn test_seq_is_per_topic() {
        let mut ob = outbound();
        ob.enqueue("personal:alice", b"a", "", 0);
        ob.enqueue("personal:bob", b"b", "", 0);
        ob.enqueue("personal:alice", b"c", "", 0);

        let mut seqs = Vec::new();
        while ob.kick() {
            let frame = decode_frame(&ob.pop_in_flight().unwrap()).unwrap();
            seqs.push((frame.topic, frame.seq));
        }
        assert_eq!(
            seqs,
            vec![
                ("personal:alice".to_string(), 1),
                ("personal:bob".to_string(), 1),
                ("personal:alice".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_kick_moves_one_frame() {
        let mut ob = outbound();
        ob.enqueue("personal:alice", &[0u8; 400], "", 0);
        assert!(ob.pending_len() >= 2);

        assert!(ob.kick());
        assert_eq!(ob.in_flight_len(), 1);
        assert!(ob.kick());
        assert_eq!(ob.in_flight_len(), 2);
    }

    #[test]
    fn test_kick_if_idle_respects_in_flight() {
        let mut ob = outbound();
        ob.enqueue("personal:alice", &[0u8; 400], "", 0);

        assert!(ob.kick_if_idle());
        assert_eq!(ob.in_flight_len(), 1);
        // Something is in flight now: no further immediate step
        assert!(!ob.kick_if_idle());
        assert_eq!(ob.in_flight_len(), 1);
    }

    #[test]
    fn test_requeue_preserves_order() {
        let mut ob = outbound();
        ob.enqueue("personal:alice", &[0u8; 400], "", 0);
        ob.kick();
        ob.kick();

        let first = ob.pop_in_flight().unwrap();
        let first_seq = decode_frame(&first).unwrap().seq;
        ob.requeue_in_flight(first);

        let again = ob.pop_in_flight().unwrap();
        assert_eq!(decode_frame(&again).unwrap().seq, first_seq);
    }
}
