//! WebSocket listener
//!
//! Two endpoints share one listener, routed by handshake path:
//!
//! - `/ws/rflink`: the bridge peer protocol. One authenticated peer at a
//!   time; inbound `rx` messages feed the inbound processor, `ping` gets
//!   `pong`, and any peer activity at all triggers an opportunistic outbox
//!   drain.
//! - `/ws/rf?topic=&graph=`: room subscription. The client receives capsule
//!   events for its room and may publish capsules of its own.

use crate::auth;
use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::link::LinkKind;
use crate::rooms::RoomBroadcaster;
use crate::util::{msg_id, now_ms, percent_decode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message, WebSocket};

/// Poll granularity for shared and room sockets
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Bind the WebSocket listener and spawn the accept thread
pub fn spawn_ws(bridge: &Arc<Bridge>) -> Result<()> {
    let listener = TcpListener::bind(&bridge.config.ws.bind).map_err(Error::Io)?;
    log::info!("ws: listening on {}", bridge.config.ws.bind);

    let bridge = Arc::clone(bridge);
    std::thread::Builder::new()
        .name("ws-listener".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                if bridge.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let bridge = Arc::clone(&bridge);
                        let spawned = std::thread::Builder::new()
                            .name("ws-conn".to_string())
                            .spawn(move || handle_connection(bridge, stream));
                        if let Err(e) = spawned {
                            log::warn!("ws: cannot spawn connection thread: {}", e);
                        }
                    }
                    Err(e) => log::warn!("ws: accept error: {}", e),
                }
            }
            log::debug!("ws: listener thread exiting");
        })
        .map_err(Error::Io)?;
    Ok(())
}

/// Captured during the handshake: path, query, and auth headers
#[derive(Default)]
struct Handshake {
    path: String,
    query: Vec<(String, String)>,
    authorization: String,
    bridge_token: String,
    bridge_sig: String,
}

impl Handshake {
    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Bearer header, `X-Bridge-Token` header, or `?token=` in that order
    fn token(&self) -> String {
        if let Some(bearer) = self.authorization.strip_prefix("Bearer ") {
            if !bearer.is_empty() {
                return bearer.to_string();
            }
        }
        if !self.bridge_token.is_empty() {
            return self.bridge_token.clone();
        }
        self.query_param("token").unwrap_or("").to_string()
    }

    fn sig(&self) -> String {
        if !self.bridge_sig.is_empty() {
            return self.bridge_sig.clone();
        }
        self.query_param("sig").unwrap_or("").to_string()
    }
}

fn handle_connection(bridge: Arc<Bridge>, stream: TcpStream) {
    let mut shake = Handshake::default();
    let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        let uri = req.uri();
        shake.path = uri.path().to_string();
        shake.query = parse_query(uri.query().unwrap_or(""));
        for (field, slot) in [
            ("authorization", &mut shake.authorization),
            ("x-bridge-token", &mut shake.bridge_token),
            ("x-bridge-sig", &mut shake.bridge_sig),
        ] {
            if let Some(value) = req.headers().get(field).and_then(|v| v.to_str().ok()) {
                *slot = value.to_string();
            }
        }
        Ok(resp)
    };

    let ws = match tungstenite::accept_hdr(stream, callback) {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("ws: handshake failed: {}", e);
            return;
        }
    };

    match shake.path.as_str() {
        "/ws/rflink" => handle_rflink(bridge, ws, &shake),
        "/ws/rf" => handle_room(bridge, ws, &shake),
        other => {
            log::debug!("ws: unknown path {:?}", other);
            close_with(ws, CloseCode::Policy, "unknown path");
        }
    }
}

fn close_with(mut ws: WebSocket<TcpStream>, code: CloseCode, reason: &'static str) {
    let _ = ws.close(Some(CloseFrame { code, reason: reason.into() }));
    let _ = ws.flush();
}

// ---------------------------------------------------------------------------
// /ws/rflink - bridge peer
// ---------------------------------------------------------------------------

fn handle_rflink(bridge: Arc<Bridge>, ws: WebSocket<TcpStream>, shake: &Handshake) {
    let token = shake.token();
    let sig = shake.sig();
    let sig_opt = (!sig.is_empty()).then_some(sig.as_str());

    if auth::authorize(&bridge.config.auth, &token, sig_opt, now_ms()).is_err() {
        log::warn!("rflink: auth fail (sig={})", sig_opt.is_some());
        close_with(ws, CloseCode::Policy, "unauthorized");
        return;
    }
    log::info!("rflink: auth ok (sig={})", sig_opt.is_some());

    let socket = Arc::new(Mutex::new(ws));
    let Some(claim) = bridge.ws_bridge.try_claim(Arc::clone(&socket)) else {
        log::warn!("rflink: rejecting second bridge peer");
        let mut ws = socket.lock();
        let _ = ws.close(Some(CloseFrame { code: CloseCode::Again, reason: "busy".into() }));
        let _ = ws.flush();
        return;
    };

    if let Err(e) = socket.lock().get_mut().set_read_timeout(Some(READ_TIMEOUT)) {
        log::warn!("rflink: cannot set read timeout: {}", e);
    }

    bridge.on_real_link_up(LinkKind::WsBridge);
    bridge.ws_bridge.send_json(&json!({
        "type": "hello",
        "mtu": bridge.profile.mtu,
        "rate_hz": bridge.profile.rate_hz,
    }));
    bridge.drain_outbox();

    while !bridge.shutdown.load(Ordering::Relaxed) {
        let result = { socket.lock().read() };
        match result {
            Ok(Message::Text(text)) => handle_bridge_message(&bridge, &text),
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                // Not part of the protocol, but a live peer is reason to drain
                bridge.drain_outbox();
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // Idle poll window; give senders a turn at the socket lock
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                log::debug!("rflink: read error: {}", e);
                break;
            }
        }
    }

    bridge.ws_bridge.release(claim);
    log::info!("rflink: peer disconnected");
}

/// One message from the bridge peer. Whatever it was, finish with an
/// opportunistic drain: a reachable peer may be able to take frames.
fn handle_bridge_message(bridge: &Arc<Bridge>, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(msg) => match msg.get("type").and_then(Value::as_str) {
            Some("rx") => {
                let topic = msg.get("topic").and_then(Value::as_str).unwrap_or("");
                let b64 = msg.get("bytes_b64").and_then(Value::as_str).unwrap_or("");
                if !topic.is_empty() && !b64.is_empty() {
                    use base64::Engine as _;
                    match base64::engine::general_purpose::STANDARD.decode(b64) {
                        Ok(bytes) => {
                            let seq = msg.get("seq").and_then(Value::as_u64).map(|s| s as u32);
                            bridge.inbound.process(topic, &bytes, seq, "ws-bridge");
                        }
                        Err(e) => log::warn!("rflink: bad base64 in rx: {}", e),
                    }
                }
            }
            Some("ping") => {
                bridge
                    .ws_bridge
                    .send_json(&json!({ "type": "pong", "ts": now_ms() }));
            }
            _ => {}
        },
        Err(_) => log::debug!("rflink: unparsable peer message"),
    }
    bridge.drain_outbox();
}

// ---------------------------------------------------------------------------
// /ws/rf - room subscription
// ---------------------------------------------------------------------------

fn handle_room(bridge: Arc<Bridge>, mut ws: WebSocket<TcpStream>, shake: &Handshake) {
    let topic = shake.query_param("topic").unwrap_or("").to_string();
    let graph = shake.query_param("graph").unwrap_or("personal").to_string();
    let key = RoomBroadcaster::topic_key(&graph, &topic);

    let (subscriber, feed) = bridge.rooms.join(&key);
    log::debug!("ws: subscriber {} joined {:?}", subscriber, key);

    let hello = json!({ "type": "hello", "topic": topic, "graph": graph, "at": now_ms() });
    if ws.send(Message::Text(hello.to_string())).is_err() {
        bridge.rooms.leave(subscriber);
        return;
    }
    if let Err(e) = ws.get_mut().set_read_timeout(Some(READ_TIMEOUT)) {
        log::warn!("ws: cannot set read timeout: {}", e);
    }

    'conn: while !bridge.shutdown.load(Ordering::Relaxed) {
        // Push any room traffic first
        while let Ok(text) = feed.try_recv() {
            if ws.send(Message::Text(text)).is_err() {
                break 'conn;
            }
        }

        match ws.read() {
            Ok(Message::Text(text)) => handle_room_publish(&bridge, &key, &graph, &topic, &text, &mut ws),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                log::debug!("ws: subscriber read error: {}", e);
                break;
            }
        }
    }

    bridge.rooms.leave(subscriber);
    log::debug!("ws: subscriber {} left {:?}", subscriber, key);
}

/// A subscriber published a capsule into its room
fn handle_room_publish(
    bridge: &Arc<Bridge>,
    key: &str,
    graph: &str,
    topic: &str,
    text: &str,
    ws: &mut WebSocket<TcpStream>,
) {
    let payload: Value = match serde_json::from_str(text) {
        Ok(payload) => payload,
        Err(_) => {
            log::debug!("ws: dropping unparsable capsule from subscriber");
            return;
        }
    };

    let capsule = payload.get("capsule").cloned().unwrap_or(payload.clone());
    let mut meta = payload.get("meta").cloned().unwrap_or_else(|| json!({}));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("graph".to_string(), json!(graph));
        if !topic.is_empty() {
            meta.insert("recipient".to_string(), json!(topic));
        }
    }
    let envelope = json!({ "capsule": capsule, "meta": meta, "ts": now_ms(), "id": msg_id() });
    bridge
        .rooms
        .broadcast(key, &json!({ "type": "capsule", "envelope": envelope }));

    if let Some((bytes, codec)) = crate::api::rf_eligible_payload(&capsule) {
        let max = bridge.config.radio.max_ingress_bytes;
        if bytes.len() > max {
            let err = json!({
                "type": "error",
                "code": "RF_PAYLOAD_TOO_LARGE",
                "details": { "size": bytes.len(), "max": max },
            });
            let _ = ws.send(Message::Text(err.to_string()));
        } else {
            bridge.enqueue_rf(key, &bytes, &codec);
        }
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let k = percent_decode(parts.next().unwrap_or(""));
            let v = percent_decode(parts.next().unwrap_or(""));
            (k, v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    fn test_bridge(dir: &std::path::Path) -> Arc<Bridge> {
        let mut config = BridgeConfig::default();
        config.spool.rx_dir = dir.join("rx").to_string_lossy().to_string();
        config.cloud.spool_dir = dir.join("cloud").to_string_lossy().to_string();
        Bridge::new(config).unwrap()
    }

    #[test]
    fn test_bridge_rx_beacon_updates_neighbors_without_spool() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = test_bridge(dir.path());

        let beacon = json!({ "id": "rn-peer", "profile": "NA-915", "rate_hz": 10.0, "mtu": 180, "ts": 1 });
        let msg = json!({
            "type": "rx",
            "topic": "control:beacon",
            "bytes_b64": BASE64.encode(beacon.to_string()),
            "seq": 7,
        })
        .to_string();
        handle_bridge_message(&bridge, &msg);

        let neighbors = bridge.neighbors.current(now_ms());
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].id, "rn-peer");
        // Beacons never create a dedup spool file, seq or not
        let rx_files = std::fs::read_dir(dir.path().join("rx")).unwrap().count();
        assert_eq!(rx_files, 0);
    }

    #[test]
    fn test_bridge_rx_payload_fans_out_with_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = test_bridge(dir.path());
        let (_id, rx) = bridge.rooms.join("personal:alice");

        let msg = json!({
            "type": "rx",
            "topic": "personal:alice",
            "bytes_b64": BASE64.encode(b"from the air"),
            "seq": 3,
        })
        .to_string();
        handle_bridge_message(&bridge, &msg);
        handle_bridge_message(&bridge, &msg);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        let rx_files = std::fs::read_dir(dir.path().join("rx")).unwrap().count();
        assert_eq!(rx_files, 1);
    }

    #[test]
    fn test_garbled_peer_message_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = test_bridge(dir.path());
        handle_bridge_message(&bridge, "not json at all");
        handle_bridge_message(&bridge, "{\"type\":\"rx\",\"topic\":\"t\",\"bytes_b64\":\"!!\"}");
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query("topic=ucs%3A%2F%2Flocal%2Fhub&graph=Personal&token=abc");
        assert_eq!(q[0], ("topic".to_string(), "ucs://local/hub".to_string()));
        assert_eq!(q[1], ("graph".to_string(), "Personal".to_string()));
        assert_eq!(q[2], ("token".to_string(), "abc".to_string()));
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_handshake_token_precedence() {
        let mut shake = Handshake::default();
        shake.query = vec![("token".to_string(), "from-query".to_string())];
        assert_eq!(shake.token(), "from-query");

        shake.bridge_token = "from-header".to_string();
        assert_eq!(shake.token(), "from-header");

        shake.authorization = "Bearer from-bearer".to_string();
        assert_eq!(shake.token(), "from-bearer");
    }
}
