//! Inbound frame processing and the dedup spool
//!
//! Every link (serial, WS bridge, mock loopback, dev injector) delivers
//! received payloads here. Frames carrying a sequence number are deduplicated
//! by `topic#seq` against an in-memory set mirrored to one JSON file per key,
//! so a restart does not replay recently seen traffic. Control topics are
//! exempt from persistence: beacons arrive every few seconds from every
//! neighbor and would grow the spool without bound.

use crate::discovery::{Beacon, BEACON_TOPIC, CONTROL_PREFIX, NeighborTable};
use crate::error::Result;
use crate::rooms::RoomBroadcaster;
use crate::util::{msg_id, now_ms};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Inbound processor shared by all link drivers
#[derive(Clone)]
pub struct InboundProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    seen: Mutex<HashMap<String, u64>>,
    rx_dir: PathBuf,
    ttl: Duration,
    neighbors: NeighborTable,
    rooms: RoomBroadcaster,
}

impl InboundProcessor {
    /// Create the processor, loading the dedup spool from `rx_dir`.
    ///
    /// Entries older than `ttl` and files that fail to parse are deleted
    /// during the load.
    pub fn new(
        rx_dir: impl Into<PathBuf>,
        ttl: Duration,
        neighbors: NeighborTable,
        rooms: RoomBroadcaster,
    ) -> Result<Self> {
        let rx_dir = rx_dir.into();
        std::fs::create_dir_all(&rx_dir)?;

        let mut seen = HashMap::new();
        let (loaded, purged) = load_spool(&rx_dir, ttl, &mut seen);
        if loaded > 0 || purged > 0 {
            log::info!("inbound: dedup spool loaded ({} entries, {} purged)", loaded, purged);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                seen: Mutex::new(seen),
                rx_dir,
                ttl,
                neighbors,
                rooms,
            }),
        })
    }

    /// Process one received payload.
    ///
    /// Sequence-carrying frames on non-control topics are dropped when
    /// already seen. Beacons update the neighbor table; everything else is
    /// wrapped in a capsule envelope and fanned out to the topic's room.
    pub fn process(&self, topic: &str, payload: &[u8], seq: Option<u32>, source: &str) {
        if let Some(seq) = seq {
            if !topic.starts_with(CONTROL_PREFIX) {
                let key = rx_key(topic, seq);
                {
                    let mut seen = self.inner.seen.lock();
                    if seen.contains_key(&key) {
                        log::debug!("inbound: duplicate {} from {}", key, source);
                        return;
                    }
                    seen.insert(key.clone(), now_ms());
                }
                self.persist(topic, seq, &key);
            }
        }

        if topic == BEACON_TOPIC {
            match serde_json::from_slice::<Beacon>(payload) {
                Ok(beacon) => {
                    log::debug!("inbound: beacon from {} via {}", beacon.id, source);
                    self.inner.neighbors.upsert(&beacon, Some(source), now_ms());
                }
                Err(e) => log::warn!("inbound: bad beacon from {}: {}", source, e),
            }
            return;
        }

        let graph = topic.split(':').next().unwrap_or("personal");
        let envelope = json!({
            "capsule": {
                "data_b64": BASE64.encode(payload),
                "rf_bytes_len": payload.len(),
            },
            "meta": { "graph": graph, "source": source },
            "ts": now_ms(),
            "id": msg_id(),
        });
        let reached = self
            .inner
            .rooms
            .broadcast(topic, &json!({ "type": "capsule", "envelope": envelope }));
        log::debug!(
            "inbound: {} bytes on {:?} from {} -> {} subscribers",
            payload.len(),
            topic,
            source,
            reached
        );
    }

    fn persist(&self, topic: &str, seq: u32, key: &str) {
        let path = self.inner.rx_dir.join(format!("{}.json", encode_key(key)));
        let entry = json!({ "topic": topic, "seq": seq, "ts": now_ms() });
        if let Err(e) = std::fs::write(&path, entry.to_string()) {
            log::warn!("inbound: cannot write dedup entry {}: {}", path.display(), e);
        }
    }

    /// Number of live dedup entries
    pub fn seen_len(&self) -> usize {
        self.inner.seen.lock().len()
    }

    /// Dedup spool lifetime
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }
}

fn rx_key(topic: &str, seq: u32) -> String {
    format!("{}#{}", topic, seq)
}

/// Percent-encode a dedup key for use as a filename.
///
/// Alphanumerics and `._-` pass through; everything else becomes `%XX`.
pub(crate) fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn load_spool(dir: &Path, ttl: Duration, seen: &mut HashMap<String, u64>) -> (usize, usize) {
    let mut loaded = 0;
    let mut purged = 0;
    let now = now_ms();
    let ttl_ms = ttl.as_millis() as u64;

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("inbound: cannot read dedup spool {}: {}", dir.display(), e);
            return (0, 0);
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
            .and_then(|v| {
                let topic = v.get("topic")?.as_str()?.to_string();
                let seq = v.get("seq")?.as_u64()? as u32;
                let ts = v.get("ts").and_then(|t| t.as_u64()).unwrap_or(now);
                Some((topic, seq, ts))
            });

        match parsed {
            Some((topic, seq, ts)) if now.saturating_sub(ts) <= ttl_ms => {
                seen.insert(rx_key(&topic, seq), ts);
                loaded += 1;
            }
            _ => {
                // Expired or unparsable: remove so the spool cannot grow stale
                let _ = std::fs::remove_file(&path);
                purged += 1;
            }
        }
    }
    (loaded, purged)
}
