//! HTTP API surface
//!
//! A small worker pool pulls requests off one `tiny_http` server. Handlers
//! only touch `Bridge` state and respond with JSON; the one slow path (the
//! immediate cloud delivery attempt in `/api/tx`) is why there is a pool
//! rather than a single loop.

pub mod ws;

use crate::auth;
use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::rooms::RoomBroadcaster;
use crate::util::{msg_id, now_ms};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tiny_http::{Header, Method, Response, Server};

/// Request body cap (JSON bodies carrying base64 payloads)
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// HTTP worker pool size
const WORKERS: usize = 4;

/// Bind the REST listener and spawn the worker pool; returns the bound address
pub fn spawn_http(bridge: &Arc<Bridge>) -> Result<std::net::SocketAddr> {
    let server = Server::http(&bridge.config.http.bind)
        .map_err(|e| Error::Other(format!("cannot bind HTTP on {}: {}", bridge.config.http.bind, e)))?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| Error::Other("HTTP listener has no IP address".to_string()))?;
    log::info!("http: listening on {}", addr);

    let server = Arc::new(server);
    for i in 0..WORKERS {
        let server = Arc::clone(&server);
        let bridge = Arc::clone(bridge);
        std::thread::Builder::new()
            .name(format!("http-worker-{}", i))
            .spawn(move || {
                while !bridge.shutdown.load(Ordering::Relaxed) {
                    match server.recv() {
                        Ok(request) => handle_request(&bridge, request),
                        Err(e) => {
                            log::warn!("http: recv error: {}", e);
                            break;
                        }
                    }
                }
            })
            .map_err(Error::Io)?;
    }
    Ok(addr)
}

fn handle_request(bridge: &Arc<Bridge>, mut request: tiny_http::Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or("").to_string();

    let (status, body) = match (&method, path.as_str()) {
        (Method::Get, "/") => {
            let response = Response::from_string(
                "rfbridge up - try /bridge/health or WebSocket /ws/rflink\n",
            );
            let _ = request.respond(response);
            return;
        }
        (Method::Get, "/health") => (200, health_wide(bridge)),
        (Method::Get, "/bridge/health") => (200, bridge_health(bridge)),
        (Method::Get, "/bridge/transports") => (200, transports(bridge)),
        (Method::Get, "/discovery/neighbors") => (200, neighbors(bridge)),
        (Method::Get, "/dev/rf/mock/status") => (200, mock_status(bridge)),
        (Method::Post, "/dev/rf/mock/enable") => mock_enable(bridge, &mut request),
        (Method::Post, "/dev/rf/mock/disable") => {
            (200, json!({ "ok": true, "config": bridge.mock.disable() }))
        }
        (Method::Post, "/dev/rf/mock/rx") => mock_rx(bridge, &mut request),
        (Method::Post, "/bridge/tx") => bridge_tx(bridge, &mut request),
        (Method::Post, "/api/tx") => api_tx(bridge, &mut request),
        _ => (404, json!({ "ok": false, "error": "not found" })),
    };
    respond_json(request, status, &body);
}

fn respond_json(request: tiny_http::Request, status: u16, body: &Value) {
    let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json; charset=utf-8"[..])
        .expect("static header");
    let response = Response::from_string(body.to_string())
        .with_status_code(status)
        .with_header(header);
    if let Err(e) = request.respond(response) {
        log::debug!("http: respond failed: {}", e);
    }
}

fn read_json_body(request: &mut tiny_http::Request) -> std::result::Result<Value, Value> {
    let mut body = String::new();
    let mut reader = request.as_reader().take(MAX_BODY_BYTES as u64 + 1);
    if reader.read_to_string(&mut body).is_err() {
        return Err(json!({ "ok": false, "error": "unreadable body" }));
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(json!({ "ok": false, "error": "body too large" }));
    }
    if body.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&body).map_err(|e| json!({ "ok": false, "error": format!("bad JSON: {}", e) }))
}

fn header_value(request: &tiny_http::Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str().to_string())
}

/// Token from `Authorization: Bearer ...` or `X-Bridge-Token`
fn token_from(request: &tiny_http::Request) -> String {
    if let Some(authz) = header_value(request, "Authorization") {
        if let Some(bearer) = authz.strip_prefix("Bearer ") {
            if !bearer.is_empty() {
                return bearer.to_string();
            }
        }
    }
    header_value(request, "X-Bridge-Token").unwrap_or_default()
}

fn check_auth(bridge: &Bridge, request: &tiny_http::Request) -> std::result::Result<(), (u16, Value)> {
    let token = token_from(request);
    let sig = header_value(request, "X-Bridge-Sig");
    match auth::authorize(&bridge.config.auth, &token, sig.as_deref(), now_ms()) {
        Ok(()) => Ok(()),
        Err(Error::TokenNotConfigured) => {
            Err((501, json!({ "ok": false, "error": "bridge token not configured" })))
        }
        Err(_) => Err((401, json!({ "ok": false, "error": "unauthorized" }))),
    }
}

fn health_wide(bridge: &Bridge) -> Value {
    let (pending, in_flight) = bridge.queue_depths();
    json!({
        "ok": true,
        "ts": now_ms(),
        "nodeId": bridge.config.node.id,
        "profile": bridge.profile_name,
        "active": { "mtu": bridge.profile.mtu, "rate_hz": bridge.profile.rate_hz },
        "profiles": bridge.profile_names,
        "rfQueue": pending,
        "rfOutbox": in_flight,
        "cloudOk": bridge.cloud.cloud_ok(),
        "queue": bridge.cloud.queue_len(),
        "neighbors": bridge.neighbors.current(now_ms()).len(),
        "maxRfIngressBytes": bridge.config.radio.max_ingress_bytes,
    })
}

fn bridge_health(bridge: &Bridge) -> Value {
    let (pending, in_flight) = bridge.queue_depths();
    json!({
        "ok": true,
        "ts": now_ms(),
        "profile": bridge.profile_name,
        "active": { "mtu": bridge.profile.mtu, "rate_hz": bridge.profile.rate_hz },
        "rfQueue": pending,
        "rfOutbox": in_flight,
        "maxRfIngressBytes": bridge.config.radio.max_ingress_bytes,
    })
}

fn transports(bridge: &Bridge) -> Value {
    let (_, in_flight) = bridge.queue_depths();
    json!({
        "ok": true,
        "drivers": bridge.registry.read().list(),
        "rfOutbox": in_flight,
    })
}

fn neighbors(bridge: &Bridge) -> Value {
    json!({
        "ok": true,
        "ttl_ms": bridge.neighbors.ttl().as_millis() as u64,
        "neighbors": bridge.neighbors.current(now_ms()),
    })
}

fn mock_status(bridge: &Bridge) -> Value {
    let (_, in_flight) = bridge.queue_depths();
    let cfg = bridge.mock.snapshot();
    json!({
        "ok": true,
        "enabled": cfg.enabled,
        "config": cfg,
        "drivers": bridge.registry.read().list(),
        "rfOutbox": in_flight,
    })
}

fn mock_enable(bridge: &Arc<Bridge>, request: &mut tiny_http::Request) -> (u16, Value) {
    let body = match read_json_body(request) {
        Ok(body) => body,
        Err(err) => return (400, err),
    };
    let cfg = bridge.mock.enable(
        body.get("loopback").and_then(Value::as_bool),
        body.get("delay_ms").and_then(Value::as_u64),
        body.get("jitter_ms").and_then(Value::as_u64),
        body.get("loss_pct").and_then(Value::as_f64),
    );
    (200, json!({ "ok": true, "config": cfg }))
}

fn mock_rx(bridge: &Arc<Bridge>, request: &mut tiny_http::Request) -> (u16, Value) {
    let body = match read_json_body(request) {
        Ok(body) => body,
        Err(err) => return (400, err),
    };
    let topic = body.get("topic").and_then(Value::as_str).unwrap_or("").trim();
    let b64 = payload_b64(&body);
    if topic.is_empty() || b64.is_empty() {
        return (400, json!({ "ok": false, "error": "missing topic or data_b64" }));
    }
    let bytes = match BASE64.decode(b64) {
        Ok(bytes) => bytes,
        Err(_) => return (400, json!({ "ok": false, "error": "invalid base64" })),
    };
    let seq = body.get("seq").and_then(Value::as_u64).map(|s| s as u32);
    bridge.inbound.process(topic, &bytes, seq, "dev-injector");
    (200, json!({ "ok": true, "len": bytes.len() }))
}

fn bridge_tx(bridge: &Arc<Bridge>, request: &mut tiny_http::Request) -> (u16, Value) {
    if let Err((status, body)) = check_auth(bridge, request) {
        return (status, body);
    }
    let body = match read_json_body(request) {
        Ok(body) => body,
        Err(err) => return (400, err),
    };

    let topic = body.get("topic").and_then(Value::as_str).unwrap_or("").trim();
    let graph = body.get("graph").and_then(Value::as_str).unwrap_or("personal");
    let codec = body.get("codec").and_then(Value::as_str).unwrap_or("");
    let b64 = payload_b64(&body);
    if topic.is_empty() || b64.is_empty() {
        return (400, json!({ "ok": false, "error": "missing topic or data_b64" }));
    }
    let bytes = match BASE64.decode(b64) {
        Ok(bytes) => bytes,
        Err(_) => return (400, json!({ "ok": false, "error": "invalid base64" })),
    };
    let max = bridge.config.radio.max_ingress_bytes;
    if bytes.len() > max {
        return (
            413,
            json!({ "ok": false, "error": "too large", "size": bytes.len(), "max": max }),
        );
    }

    let rf_topic = RoomBroadcaster::topic_key(graph, topic);
    let stats = bridge.enqueue_rf(&rf_topic, &bytes, codec);
    (
        200,
        json!({
            "ok": true,
            "topic": rf_topic,
            "mtu": bridge.profile.mtu,
            "rate_hz": bridge.profile.rate_hz,
            "rfQueue": stats.pending,
            "rfOutbox": stats.in_flight,
        }),
    )
}

/// Capsule ingest: local fanout, RF bridge for an embedded payload, and
/// best-effort cloud replication.
fn api_tx(bridge: &Arc<Bridge>, request: &mut tiny_http::Request) -> (u16, Value) {
    let body = match read_json_body(request) {
        Ok(body) => body,
        Err(err) => return (400, err),
    };

    let recipient = body.get("recipient").and_then(Value::as_str).unwrap_or("").trim();
    if recipient.is_empty() {
        return (400, json!({ "ok": false, "error": "missing recipient" }));
    }
    let graph = body
        .get("graph")
        .and_then(Value::as_str)
        .unwrap_or("personal")
        .to_lowercase();
    let key = RoomBroadcaster::topic_key(&graph, recipient);
    let id = msg_id();

    let capsule = body.get("capsule").cloned().unwrap_or_else(|| json!({}));
    let mut meta = body.get("meta").cloned().unwrap_or_else(|| json!({}));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("graph".to_string(), json!(graph));
        meta.insert("recipient".to_string(), json!(recipient));
    }
    let envelope = json!({ "capsule": capsule, "meta": meta, "ts": now_ms(), "id": id });

    // 1) Always fan out locally
    bridge
        .rooms
        .broadcast(&key, &json!({ "type": "capsule", "envelope": envelope }));

    // 2) RF bridge for an embedded payload, size-guarded
    if let Some((bytes, codec)) = rf_eligible_payload(&capsule) {
        if bytes.len() <= bridge.config.radio.max_ingress_bytes {
            bridge.enqueue_rf(&key, &bytes, &codec);
        } else {
            log::warn!(
                "api: capsule payload for {} exceeds ingress cap ({} bytes), not bridged",
                key,
                bytes.len()
            );
        }
    }

    // 3) Best-effort cloud replication
    let (forwarded, queued) = bridge.cloud.submit(
        &id,
        json!({ "recipient": recipient, "graph": graph, "capsule": capsule, "meta": envelope["meta"] }),
    );

    (200, json!({ "ok": true, "msg_id": id, "forwarded": forwarded, "queued": queued }))
}

/// Base64 payload field under any of its accepted names
fn payload_b64(body: &Value) -> &str {
    for field in ["data_b64", "bytes_b64", "b64"] {
        if let Some(s) = body.get(field).and_then(Value::as_str) {
            if !s.is_empty() {
                return s;
            }
        }
    }
    ""
}

/// Extract an RF-eligible payload (`capsule.payload.data_b64` + codec)
pub(crate) fn rf_eligible_payload(capsule: &Value) -> Option<(Vec<u8>, String)> {
    let payload = capsule.get("payload")?;
    let b64 = payload.get("data_b64").and_then(Value::as_str)?;
    let codec = payload
        .get("codec")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    match BASE64.decode(b64) {
        Ok(bytes) => Some((bytes, codec)),
        Err(e) => {
            log::warn!("api: capsule payload has invalid base64: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use std::time::Duration;

    fn test_bridge(dir: &std::path::Path, http_bind: &str) -> Arc<Bridge> {
        let mut config = BridgeConfig::default();
        config.spool.rx_dir = dir.join("rx").to_string_lossy().to_string();
        config.cloud.spool_dir = dir.join("cloud").to_string_lossy().to_string();
        config.http.bind = http_bind.to_string();
        Bridge::new(config).unwrap()
    }

    #[test]
    fn test_http_endpoints_live() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = test_bridge(dir.path(), "127.0.0.1:0");
        let addr = spawn_http(&bridge).unwrap();
        let base = format!("http://{}", addr);
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(2))
            .build();

        // Health reports the active profile
        let health: Value = agent
            .get(&format!("{}/bridge/health", base))
            .call()
            .unwrap()
            .into_json()
            .unwrap();
        assert_eq!(health["ok"], true);
        assert_eq!(health["active"]["mtu"], 180);
        assert_eq!(health["active"]["rate_hz"], 10.0);

        // Unauthenticated tx is rejected
        let denied = agent
            .post(&format!("{}/bridge/tx", base))
            .send_json(json!({ "topic": "alice", "data_b64": "QQ==" }));
        assert!(matches!(denied, Err(ureq::Error::Status(401, _))));

        // Authenticated tx fragments the payload (500B at MTU 180 -> 4 frames)
        let payload = vec![7u8; 500];
        let accepted: Value = agent
            .post(&format!("{}/bridge/tx", base))
            .set("X-Bridge-Token", "dev-bridge")
            .send_json(json!({ "topic": "alice", "data_b64": BASE64.encode(&payload) }))
            .unwrap()
            .into_json()
            .unwrap();
        assert_eq!(accepted["ok"], true);
        assert_eq!(accepted["topic"], "personal:alice");
        // One frame took the idle kick, the rest are pending
        assert_eq!(accepted["rfOutbox"], 1);
        assert_eq!(accepted["rfQueue"], 3);

        // Oversized tx is refused outright
        let huge = vec![0u8; 600 * 1024];
        let refused = agent
            .post(&format!("{}/bridge/tx", base))
            .set("X-Bridge-Token", "dev-bridge")
            .send_json(json!({ "topic": "alice", "data_b64": BASE64.encode(&huge) }));
        assert!(matches!(refused, Err(ureq::Error::Status(413, _))));

        // Synthetic inbound injection lands in the neighbor table
        let beacon = json!({ "id": "rn-injected", "profile": "NA-915", "rate_hz": 10.0, "mtu": 180, "ts": 1 });
        let injected: Value = agent
            .post(&format!("{}/dev/rf/mock/rx", base))
            .send_json(json!({ "topic": "control:beacon", "data_b64": BASE64.encode(beacon.to_string()) }))
            .unwrap()
            .into_json()
            .unwrap();
        assert_eq!(injected["ok"], true);

        let neighbors: Value = agent
            .get(&format!("{}/discovery/neighbors", base))
            .call()
            .unwrap()
            .into_json()
            .unwrap();
        assert_eq!(neighbors["neighbors"][0]["id"], "rn-injected");

        // Transport listing carries the built-in drivers
        let transports: Value = agent
            .get(&format!("{}/bridge/transports", base))
            .call()
            .unwrap()
            .into_json()
            .unwrap();
        let ids: Vec<&str> = transports["drivers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"mock-1"));
        assert!(ids.contains(&"ws-bridge-1"));
    }

    #[test]
    fn test_payload_b64_aliases() {
        assert_eq!(payload_b64(&json!({ "data_b64": "QQ==" })), "QQ==");
        assert_eq!(payload_b64(&json!({ "bytes_b64": "QQ==" })), "QQ==");
        assert_eq!(payload_b64(&json!({ "b64": "QQ==" })), "QQ==");
        assert_eq!(payload_b64(&json!({ "data_b64": "" })), "");
        assert_eq!(payload_b64(&json!({})), "");
    }

    #[test]
    fn test_rf_eligible_payload() {
        let capsule = json!({
            "payload": { "data_b64": BASE64.encode(b"voice"), "codec": "audio/opus" }
        });
        let (bytes, codec) = rf_eligible_payload(&capsule).unwrap();
        assert_eq!(bytes, b"voice");
        assert_eq!(codec, "audio/opus");

        assert!(rf_eligible_payload(&json!({})).is_none());
        assert!(rf_eligible_payload(&json!({ "payload": { "data_b64": "!!" } })).is_none());
    }
}
