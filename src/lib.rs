//! rfbridge - RF message bridge daemon
//!
//! Moves small opaque payloads between a local pub/sub fanout and one or more
//! low-bandwidth links (serial radio modem, WebSocket-tunneled bridge peer,
//! or a software mock), with best-effort store-and-forward replication to a
//! cloud endpoint.
//!
//! ## Data path
//!
//! Outbound: a capsule arrives over HTTP or WebSocket, fans out to local room
//! subscribers, and - when it carries an RF-eligible payload - is fragmented
//! into MTU-sized frames, paced at the band profile's rate, and offered to
//! every registered link driver. Inbound: a driver delivers bytes, the frame
//! codec decodes them, the dedup spool filters replays, and the payload
//! either updates the neighbor table (beacons) or fans out to its room.

pub mod api;
pub mod auth;
pub mod band;
pub mod bridge;
pub mod cloud;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod inbound;
pub mod link;
pub mod outbound;
pub mod rooms;
pub mod util;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{Error, Result};
