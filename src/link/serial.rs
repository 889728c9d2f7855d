//! Serial link manager
//!
//! Owns the serial transport's connect/reconnect state machine. A manager
//! thread opens the device, feeds received lines to the inbound processor,
//! and on any failure tears the port down and retries with exponential
//! backoff (1s doubling to a 15s cap, reset after a successful open). The
//! driver side writes newline-terminated base64 frames while the port is up.
//!
//! Inbound line protocol: a line is either the base64 of a whole wire frame,
//! or a JSON envelope `{topic?, bytes_b64|data_b64}` carrying raw payload
//! bytes for a topic. Undecodable lines are logged and dropped.

use crate::config::SerialConfig;
use crate::error::Result;
use crate::frame;
use crate::inbound::InboundProcessor;
use crate::link::{LinkDriver, LinkKind};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(15);

/// Runaway guard for a line that never terminates
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Serial link driver and its shared connection state
pub struct SerialLink {
    id: String,
    device: String,
    baud: u32,
    up: AtomicBool,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
}

impl SerialLink {
    /// Spawn the manager thread and return the driver handle.
    ///
    /// `on_up` runs after every successful open (mock auto-disable plus an
    /// immediate outbox drain live there).
    pub fn spawn(
        cfg: &SerialConfig,
        inbound: InboundProcessor,
        on_up: Arc<dyn Fn() + Send + Sync>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let link = Arc::new(Self {
            id: format!("serial:{}", sanitize_device(&cfg.device)),
            device: cfg.device.clone(),
            baud: cfg.baud,
            up: AtomicBool::new(false),
            writer: Mutex::new(None),
        });

        let manager = Arc::clone(&link);
        let default_topic = cfg.default_topic.clone();
        std::thread::Builder::new()
            .name("serial-manager".to_string())
            .spawn(move || {
                manager.manage(inbound, default_topic, on_up, shutdown);
                log::debug!("serial: manager thread exiting");
            })
            .map_err(crate::error::Error::Io)?;

        Ok(link)
    }

    /// Connect/reconnect loop
    fn manage(
        &self,
        inbound: InboundProcessor,
        default_topic: String,
        on_up: Arc<dyn Fn() + Send + Sync>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut backoff = BACKOFF_INITIAL;
        while !shutdown.load(Ordering::Relaxed) {
            if !Path::new(&self.device).exists() {
                log::warn!(
                    "serial: {} not present; retrying in {:?}",
                    self.device,
                    backoff
                );
                sleep_interruptible(backoff, &shutdown);
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }

            let port = serialport::new(&self.device, self.baud)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(100))
                .open();

            let mut reader = match port.and_then(|p| {
                let reader = p.try_clone()?;
                *self.writer.lock() = Some(p);
                Ok(reader)
            }) {
                Ok(reader) => reader,
                Err(e) => {
                    log::warn!(
                        "serial: open {} failed: {}; retrying in {:?}",
                        self.device,
                        e,
                        backoff
                    );
                    sleep_interruptible(backoff, &shutdown);
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
            };

            self.up.store(true, Ordering::Release);
            log::info!("serial: up @ {} {}bps", self.device, self.baud);
            backoff = BACKOFF_INITIAL;
            on_up();

            self.read_lines(&mut *reader, &inbound, &default_topic, &shutdown);

            // Link lost: clear state before re-entering backoff
            self.up.store(false, Ordering::Release);
            *self.writer.lock() = None;
            if !shutdown.load(Ordering::Relaxed) {
                log::warn!("serial: {} closed; retrying in {:?}", self.device, backoff);
                sleep_interruptible(backoff, &shutdown);
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }

    /// Pump the port for newline-terminated lines until error or shutdown
    fn read_lines(
        &self,
        reader: &mut dyn SerialPort,
        inbound: &InboundProcessor,
        default_topic: &str,
        shutdown: &AtomicBool,
    ) {
        let mut acc: Vec<u8> = Vec::new();
        let mut buf = [0u8; 256];
        while !shutdown.load(Ordering::Relaxed) {
            let n = match reader.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    log::warn!("serial: read error: {}", e);
                    return;
                }
            };
            if n == 0 {
                continue;
            }
            acc.extend_from_slice(&buf[..n]);

            while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = acc.drain(..=pos).collect();
                match std::str::from_utf8(&line) {
                    Ok(text) => handle_line(inbound, default_topic, &self.id, text),
                    Err(_) => log::warn!("serial: dropping non-UTF-8 line"),
                }
            }
            if acc.len() > MAX_LINE_BYTES {
                log::warn!("serial: discarding {} unterminated bytes", acc.len());
                acc.clear();
            }
        }
    }
}

impl LinkDriver for SerialLink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> LinkKind {
        LinkKind::Serial
    }

    fn send_b64(&self, b64: &str) -> bool {
        if !self.up.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.writer.lock();
        let Some(port) = guard.as_mut() else {
            return false;
        };
        match writeln!(port, "{}", b64) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("serial: write failed: {}", e);
                false
            }
        }
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({ "device": self.device, "baud": self.baud })
    }
}

/// Decode one received line and hand it to the inbound processor.
///
/// A bare line is the base64 of a whole frame; a JSON object line is an
/// envelope carrying payload bytes (`bytes_b64`/`data_b64`) for an optional
/// topic. Anything undecodable is logged and dropped.
fn handle_line(inbound: &InboundProcessor, default_topic: &str, source: &str, line: &str) {
    let s = line.trim();
    if s.is_empty() {
        return;
    }

    if s.starts_with('{') {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(s) else {
            log::warn!("serial: dropping unparsable JSON line");
            return;
        };
        let topic = value
            .get("topic")
            .and_then(|t| t.as_str())
            .unwrap_or(default_topic);
        let Some(b64) = value
            .get("bytes_b64")
            .or_else(|| value.get("data_b64"))
            .and_then(|b| b.as_str())
        else {
            log::warn!("serial: JSON line without payload field");
            return;
        };
        match BASE64.decode(b64) {
            Ok(bytes) => inbound.process(topic, &bytes, None, source),
            Err(e) => log::warn!("serial: bad base64 in JSON line: {}", e),
        }
        return;
    }

    let bytes = match BASE64.decode(s) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("serial: bad base64 line: {}", e);
            return;
        }
    };
    match frame::decode_frame(&bytes) {
        Ok(f) => inbound.process(&f.topic, &f.payload, Some(f.seq), source),
        Err(e) => log::warn!("serial: undecodable frame: {}", e),
    }
}

fn sanitize_device(device: &str) -> String {
    device
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO && !shutdown.load(Ordering::Relaxed) {
        let slice = remaining.min(step);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::NeighborTable;
    use crate::frame::encode_frame;
    use crate::rooms::RoomBroadcaster;
    use serde_json::json;

    fn inbound(dir: &std::path::Path) -> (InboundProcessor, RoomBroadcaster) {
        let rooms = RoomBroadcaster::new();
        let processor = InboundProcessor::new(
            dir,
            Duration::from_secs(3600),
            NeighborTable::new(Duration::from_secs(60)),
            rooms.clone(),
        )
        .unwrap();
        (processor, rooms)
    }

    #[test]
    fn test_bare_b64_line_is_a_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, rooms) = inbound(dir.path());
        let (_id, rx) = rooms.join("personal:alice");

        let encoded = encode_frame("personal:alice", 3, 0, "", b"hi").unwrap();
        handle_line(&processor, "personal:hub", "serial:test", &BASE64.encode(&encoded));

        let msg: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(msg["envelope"]["capsule"]["rf_bytes_len"], 2);
        // The frame's own seq feeds dedup
        handle_line(&processor, "personal:hub", "serial:test", &BASE64.encode(&encoded));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_json_envelope_line() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, rooms) = inbound(dir.path());
        let (_id, rx) = rooms.join("work:bob");

        let line = json!({ "topic": "work:bob", "bytes_b64": BASE64.encode(b"payload") }).to_string();
        handle_line(&processor, "personal:hub", "serial:test", &line);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_json_envelope_defaults_topic() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, rooms) = inbound(dir.path());
        let (_id, rx) = rooms.join("personal:hub");

        let line = json!({ "data_b64": BASE64.encode(b"payload") }).to_string();
        handle_line(&processor, "personal:hub", "serial:test", &line);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_garbage_lines_dropped_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _rooms) = inbound(dir.path());

        for line in ["", "   ", "!!!not-base64!!!", "{not json", "{\"topic\": \"x\"}"] {
            handle_line(&processor, "personal:hub", "serial:test", line);
        }
        // Valid base64 that is not a frame is dropped too
        handle_line(&processor, "personal:hub", "serial:test", &BASE64.encode(b""));
    }

    #[test]
    fn test_sanitize_device() {
        assert_eq!(sanitize_device("/dev/ttyUSB0"), "_dev_ttyUSB0");
        assert_eq!(sanitize_device("COM3"), "COM3");
    }
}
