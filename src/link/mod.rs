//! Link drivers: pluggable transports behind one capability interface
//!
//! A driver accepts base64-encoded frames and reports its own liveness. The
//! registry keeps an ordered list and drains the in-flight queue by offering
//! each frame to every driver: the frame counts as delivered when any driver
//! accepts it. At most one real link is normally up, so this is opportunistic
//! availability, not routing.

pub mod mock;
pub mod serial;
pub mod ws_bridge;

use crate::outbound::Outbound;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Transport flavor tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    Serial,
    WsBridge,
    Mock,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Serial => write!(f, "serial"),
            LinkKind::WsBridge => write!(f, "ws-bridge"),
            LinkKind::Mock => write!(f, "mock"),
        }
    }
}

/// Capability interface implemented by every transport
pub trait LinkDriver: Send + Sync {
    /// Stable driver id, unique within the registry
    fn id(&self) -> &str;

    /// Transport flavor
    fn kind(&self) -> LinkKind;

    /// Offer one base64-encoded frame; `true` means the driver accepted it
    fn send_b64(&self, b64: &str) -> bool;

    /// Is the underlying link currently usable?
    fn is_up(&self) -> bool;

    /// Driver-specific observability fields
    fn stats(&self) -> serde_json::Value;
}

/// Observability row for one registered driver
#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub id: String,
    pub kind: LinkKind,
    pub up: bool,
    #[serde(flatten)]
    pub stats: serde_json::Value,
}

/// Ordered driver list with idempotent registration
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn LinkDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self { drivers: Vec::new() }
    }

    /// Register a driver; a second registration under the same id is ignored
    pub fn register(&mut self, driver: Arc<dyn LinkDriver>) {
        if self.drivers.iter().any(|d| d.id() == driver.id()) {
            log::debug!("link: driver {} already registered", driver.id());
            return;
        }
        log::info!("link: registered driver {} ({})", driver.id(), driver.kind());
        self.drivers.push(driver);
    }

    /// Number of registered drivers
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Status rows for all drivers
    pub fn list(&self) -> Vec<DriverStatus> {
        self.drivers
            .iter()
            .map(|d| DriverStatus {
                id: d.id().to_string(),
                kind: d.kind(),
                up: d.is_up(),
                stats: d.stats(),
            })
            .collect()
    }

    /// Drain the in-flight queue through the drivers.
    ///
    /// Each frame is offered to every driver; if none accepts, the frame goes
    /// back to the head of the queue and draining stops until the next kick.
    pub fn drain(&self, outbound: &mut Outbound) {
        if self.drivers.is_empty() {
            return;
        }
        while let Some(frame) = outbound.pop_in_flight() {
            let b64 = BASE64.encode(&frame);
            let mut delivered = false;
            for driver in &self.drivers {
                delivered = driver.send_b64(&b64) || delivered;
            }
            if !delivered {
                outbound.requeue_in_flight(frame);
                break;
            }
        }
    }
}
