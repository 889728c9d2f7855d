//! WebSocket bridge link
//!
//! Exactly one authenticated peer may act as the bridge at a time. The
//! connection handling (handshake, auth, read loop) lives in the WebSocket
//! server; this module owns the exclusive active-peer slot and exposes it to
//! the driver registry. Outbound frames travel as `{type:"tx", bytes_b64}`
//! JSON messages.

use crate::link::{LinkDriver, LinkKind};
use parking_lot::Mutex;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tungstenite::{Message, WebSocket};

/// Shared handle to one peer's socket
pub type PeerSocket = Arc<Mutex<WebSocket<TcpStream>>>;

struct ActivePeer {
    claim: u64,
    socket: PeerSocket,
}

/// The single-active-bridge slot, registered as a link driver
pub struct WsBridgeLink {
    active: Mutex<Option<ActivePeer>>,
    next_claim: AtomicU64,
}

impl WsBridgeLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(None),
            next_claim: AtomicU64::new(1),
        })
    }

    /// Claim the bridge slot for a freshly accepted peer.
    ///
    /// Returns a claim ticket for [`release`](Self::release), or `None` when
    /// another peer already holds the slot.
    pub fn try_claim(&self, socket: PeerSocket) -> Option<u64> {
        let mut active = self.active.lock();
        if active.is_some() {
            return None;
        }
        let claim = self.next_claim.fetch_add(1, Ordering::Relaxed);
        *active = Some(ActivePeer { claim, socket });
        log::info!("ws-bridge: peer attached (claim {})", claim);
        Some(claim)
    }

    /// Vacate the slot; a stale ticket (already replaced peer) is ignored
    pub fn release(&self, claim: u64) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|p| p.claim == claim) {
            *active = None;
            log::info!("ws-bridge: peer detached (claim {})", claim);
        }
    }

    /// Send a JSON message to the active peer, if any
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        let socket = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(peer) => Arc::clone(&peer.socket),
                None => return false,
            }
        };
        let mut ws = socket.lock();
        match ws.send(Message::Text(value.to_string())) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("ws-bridge: send failed: {}", e);
                false
            }
        }
    }
}

impl LinkDriver for WsBridgeLink {
    fn id(&self) -> &str {
        "ws-bridge-1"
    }

    fn kind(&self) -> LinkKind {
        LinkKind::WsBridge
    }

    fn send_b64(&self, b64: &str) -> bool {
        self.send_json(&serde_json::json!({ "type": "tx", "bytes_b64": b64 }))
    }

    fn is_up(&self) -> bool {
        self.active.lock().is_some()
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({ "peer": self.is_up() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tungstenite::protocol::Role;

    /// Connected WebSocket pair over localhost, no HTTP handshake
    fn socket_pair() -> (PeerSocket, WebSocket<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_stream = TcpStream::connect(addr).unwrap();
        let (server_stream, _) = listener.accept().unwrap();

        let server = WebSocket::from_raw_socket(server_stream, Role::Server, None);
        let client = WebSocket::from_raw_socket(client_stream, Role::Client, None);
        (Arc::new(Mutex::new(server)), client)
    }

    #[test]
    fn test_single_active_bridge() {
        let link = WsBridgeLink::new();
        let (first, _keep1) = socket_pair();
        let (second, _keep2) = socket_pair();

        let claim = link.try_claim(first).unwrap();
        assert!(link.is_up());
        // Slot is exclusive while occupied
        assert!(link.try_claim(Arc::clone(&second)).is_none());

        link.release(claim);
        assert!(!link.is_up());
        assert!(link.try_claim(second).is_some());
    }

    #[test]
    fn test_stale_release_ignored() {
        let link = WsBridgeLink::new();
        let (first, _keep1) = socket_pair();
        let (second, _keep2) = socket_pair();

        let old_claim = link.try_claim(first).unwrap();
        link.release(old_claim);
        let _new_claim = link.try_claim(second).unwrap();

        // Releasing with the superseded ticket must not evict the new peer
        link.release(old_claim);
        assert!(link.is_up());
    }

    #[test]
    fn test_send_b64_ships_tx_message() {
        let link = WsBridgeLink::new();
        let (server, mut client) = socket_pair();
        link.try_claim(server).unwrap();

        assert!(link.send_b64("QUJD"));

        let msg = client.read().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "tx");
        assert_eq!(value["bytes_b64"], "QUJD");
    }

    #[test]
    fn test_send_without_peer_not_accepted() {
        let link = WsBridgeLink::new();
        assert!(!link.send_b64("QUJD"));
        assert!(!link.is_up());
    }
}
