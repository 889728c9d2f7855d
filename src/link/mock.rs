//! Mock link driver for hardware-free testing
//!
//! Claims frames only while enabled. Loss is simulated by dropping the frame
//! while still reporting it accepted, exactly as a real radio loses frames
//! invisibly to the sender. With loopback on, accepted frames are decoded and
//! re-injected into the inbound path after a configurable delay with jitter,
//! which exercises the whole pipeline end to end without hardware.

use crate::frame;
use crate::inbound::InboundProcessor;
use crate::link::{LinkDriver, LinkKind};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Runtime-adjustable mock behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockCfg {
    pub enabled: bool,
    pub loopback: bool,
    pub delay_ms: u64,
    pub jitter_ms: u64,
    pub loss_pct: f64,
}

impl Default for MockCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            loopback: false,
            delay_ms: 0,
            jitter_ms: 0,
            loss_pct: 0.0,
        }
    }
}

/// Software-only link driver
pub struct MockLink {
    cfg: Mutex<MockCfg>,
    inbound: InboundProcessor,
}

impl MockLink {
    pub fn new(inbound: InboundProcessor) -> Arc<Self> {
        Arc::new(Self {
            cfg: Mutex::new(MockCfg::default()),
            inbound,
        })
    }

    /// Enable the mock, merging any provided overrides
    pub fn enable(&self, loopback: Option<bool>, delay_ms: Option<u64>, jitter_ms: Option<u64>, loss_pct: Option<f64>) -> MockCfg {
        let mut cfg = self.cfg.lock();
        cfg.enabled = true;
        if let Some(loopback) = loopback {
            cfg.loopback = loopback;
        }
        if let Some(delay) = delay_ms {
            cfg.delay_ms = delay;
        }
        if let Some(jitter) = jitter_ms {
            cfg.jitter_ms = jitter;
        }
        if let Some(loss) = loss_pct {
            cfg.loss_pct = loss.clamp(0.0, 100.0);
        }
        log::info!("mock: enabled {:?}", *cfg);
        cfg.clone()
    }

    /// Disable the mock
    pub fn disable(&self) -> MockCfg {
        let mut cfg = self.cfg.lock();
        if cfg.enabled {
            log::info!("mock: disabled");
        }
        cfg.enabled = false;
        cfg.clone()
    }

    /// Current configuration snapshot
    pub fn snapshot(&self) -> MockCfg {
        self.cfg.lock().clone()
    }

    fn loop_back(&self, b64: &str, delay: Duration) {
        let decoded = match BASE64.decode(b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("mock: bad base64 in loopback: {}", e);
                return;
            }
        };
        let frame = match frame::decode_frame(&decoded) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("mock: undecodable frame in loopback: {}", e);
                return;
            }
        };

        let inbound = self.inbound.clone();
        let spawned = std::thread::Builder::new()
            .name("mock-loopback".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                inbound.process(&frame.topic, &frame.payload, Some(frame.seq), "mock-loopback");
            });
        if let Err(e) = spawned {
            log::warn!("mock: cannot spawn loopback thread: {}", e);
        }
    }
}

impl LinkDriver for MockLink {
    fn id(&self) -> &str {
        "mock-1"
    }

    fn kind(&self) -> LinkKind {
        LinkKind::Mock
    }

    fn send_b64(&self, b64: &str) -> bool {
        let cfg = self.cfg.lock().clone();
        if !cfg.enabled {
            return false;
        }
        // Loss is invisible to the sender: claim the frame, then drop it
        if cfg.loss_pct > 0.0 && rand::thread_rng().gen_range(0.0..100.0) < cfg.loss_pct {
            log::debug!("mock: frame lost");
            return true;
        }
        if cfg.loopback {
            let jitter = if cfg.jitter_ms > 0 {
                rand::thread_rng().gen_range(-(cfg.jitter_ms as i64)..=cfg.jitter_ms as i64)
            } else {
                0
            };
            let delay_ms = (cfg.delay_ms as i64 + jitter).max(0) as u64;
            self.loop_back(b64, Duration::from_millis(delay_ms));
        }
        true
    }

    fn is_up(&self) -> bool {
        self.cfg.lock().enabled
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({ "mock": self.snapshot() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::NeighborTable;
    use crate::frame::encode_frame;
    use crate::rooms::RoomBroadcaster;
    use std::time::Instant;

    fn mock_link(dir: &std::path::Path) -> (Arc<MockLink>, RoomBroadcaster) {
        let rooms = RoomBroadcaster::new();
        let inbound = InboundProcessor::new(
            dir,
            Duration::from_secs(3600),
            NeighborTable::new(Duration::from_secs(60)),
            rooms.clone(),
        )
        .unwrap();
        (MockLink::new(inbound), rooms)
    }

    fn frame_b64(topic: &str, seq: u32) -> String {
        BASE64.encode(encode_frame(topic, seq, 0, "", b"ping").unwrap())
    }

    #[test]
    fn test_disabled_claims_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, _rooms) = mock_link(dir.path());
        assert!(!mock.is_up());
        assert!(!mock.send_b64(&frame_b64("personal:alice", 1)));
    }

    #[test]
    fn test_full_loss_still_claims() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, rooms) = mock_link(dir.path());
        mock.enable(Some(true), None, None, Some(100.0));
        let (_id, rx) = rooms.join("personal:alice");

        assert!(mock.send_b64(&frame_b64("personal:alice", 1)));
        std::thread::sleep(Duration::from_millis(50));
        // Lost frames never reach the inbound path
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_loopback_reinjects() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, rooms) = mock_link(dir.path());
        mock.enable(Some(true), Some(10), None, None);
        let (_id, rx) = rooms.join("personal:alice");

        assert!(mock.send_b64(&frame_b64("personal:alice", 5)));

        let deadline = Instant::now() + Duration::from_secs(2);
        let msg = loop {
            match rx.try_recv() {
                Ok(msg) => break msg,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("loopback never arrived: {}", e),
            }
        };
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["type"], "capsule");
        assert_eq!(value["envelope"]["meta"]["source"], "mock-loopback");
    }

    #[test]
    fn test_enable_merges_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, _rooms) = mock_link(dir.path());
        mock.enable(Some(true), Some(20), None, Some(150.0));

        let cfg = mock.snapshot();
        assert!(cfg.enabled);
        assert!(cfg.loopback);
        assert_eq!(cfg.delay_ms, 20);
        assert_eq!(cfg.jitter_ms, 0);
        // Loss clamps to a percentage
        assert_eq!(cfg.loss_pct, 100.0);

        mock.disable();
        assert!(!mock.is_up());
        // Overrides survive a disable/enable cycle
        assert_eq!(mock.snapshot().delay_ms, 20);
    }
}
