//! Discovery beacons and the neighbor table
//!
//! Each node periodically announces `{id, profile, rate_hz, mtu, ts}` on the
//! reserved `control:beacon` topic. Receivers upsert the sender into a
//! neighbor table whose entries expire lazily on read.

use crate::band::BandProfile;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Reserved topic carrying discovery beacons
pub const BEACON_TOPIC: &str = "control:beacon";

/// Codec tag attached to beacon frames
pub const BEACON_CODEC: &str = "beacon/json";

/// Topic prefix for control traffic (never persisted to the dedup spool)
pub const CONTROL_PREFIX: &str = "control:";

/// Self-announcement payload.
///
/// Only `id` is mandatory on receipt; peers running other profiles may omit
/// the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub id: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub rate_hz: f64,
    #[serde(default)]
    pub mtu: usize,
    #[serde(default)]
    pub ts: u64,
}

impl Beacon {
    pub fn new(node_id: &str, profile_name: &str, profile: BandProfile, ts: u64) -> Self {
        Self {
            id: node_id.to_string(),
            profile: profile_name.to_string(),
            rate_hz: profile.rate_hz,
            mtu: profile.mtu,
            ts,
        }
    }
}

/// One known peer, refreshed on every beacon
#[derive(Debug, Clone, Serialize)]
pub struct Neighbor {
    pub id: String,
    pub profile: String,
    pub rate_hz: f64,
    pub mtu: usize,
    /// Wall-clock ms of the last beacon from this peer
    pub seen_at: u64,
    /// Which link delivered the last beacon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Neighbor table keyed by node id
#[derive(Clone)]
pub struct NeighborTable {
    inner: Arc<Mutex<HashMap<String, Neighbor>>>,
    ttl: Duration,
}

impl NeighborTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh a neighbor from a received beacon
    pub fn upsert(&self, beacon: &Beacon, source: Option<&str>, now_ms: u64) {
        let mut table = self.inner.lock();
        table.insert(
            beacon.id.clone(),
            Neighbor {
                id: beacon.id.clone(),
                profile: beacon.profile.clone(),
                rate_hz: beacon.rate_hz,
                mtu: beacon.mtu,
                seen_at: now_ms,
                source: source.map(str::to_string),
            },
        );
    }

    /// Live neighbors, most recently seen first.
    ///
    /// Entries older than the TTL are evicted as a side effect.
    pub fn current(&self, now_ms: u64) -> Vec<Neighbor> {
        let ttl_ms = self.ttl.as_millis() as u64;
        let mut table = self.inner.lock();
        table.retain(|_, n| now_ms.saturating_sub(n.seen_at) <= ttl_ms);

        let mut out: Vec<Neighbor> = table.values().cloned().collect();
        out.sort_by(|a, b| b.seen_at.cmp(&a.seen_at));
        out
    }
}
