//! Configuration for the bridge daemon
//!
//! Loads configuration from a TOML file. Every field has a default, so the
//! daemon runs with no file at all; a partial file only needs the fields it
//! wants to change.

use crate::error::Result;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub node: NodeConfig,
    pub radio: RadioConfig,
    pub serial: SerialConfig,
    pub http: HttpConfig,
    pub ws: WsConfig,
    pub auth: AuthConfig,
    pub cloud: CloudConfig,
    pub spool: SpoolConfig,
}

/// Node identity
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id advertised in discovery beacons
    pub id: String,
}

/// Radio link parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Active band profile name (see `band::builtin_profiles`)
    pub profile: String,
    /// Optional TOML file replacing the built-in profile table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_file: Option<String>,
    /// Max raw payload bytes accepted per capsule before fragmentation
    pub max_ingress_bytes: usize,
    /// Discovery beacon interval
    pub beacon_interval_ms: u64,
    /// Neighbor table entry lifetime
    pub neighbor_ttl_ms: u64,
    /// Disable the mock driver as soon as a real link comes up
    pub auto_disable_mock_on_real_link: bool,
}

/// Serial link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path; empty disables the serial link
    pub device: String,
    /// Baud rate
    pub baud: u32,
    /// Topic assumed for bare-base64 inbound lines
    pub default_topic: String,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address for the REST API
    pub bind: String,
}

/// WebSocket configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WsConfig {
    /// Bind address for the WebSocket listener
    pub bind: String,
}

/// Bridge authentication
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Current bridge token; empty disables authenticated surfaces
    pub token: String,
    /// Next token accepted during rotation
    pub token_next: String,
    /// Reject plain tokens without a signature
    pub require_sig: bool,
    /// Allowed clock skew for signed requests
    pub sig_tolerance_ms: u64,
}

/// Cloud forwarding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Cloud base URL; `None` disables forwarding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-request delivery timeout
    pub timeout_ms: u64,
    /// Spool directory for queued forwards
    pub spool_dir: String,
    /// Queue item cap
    pub max_items: usize,
    /// Queue byte cap
    pub max_bytes: usize,
    /// Queue entry lifetime
    pub ttl_ms: u64,
}

/// RF receive-side spool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Directory holding dedup entries
    pub rx_dir: String,
    /// Dedup entry lifetime in seconds
    pub rx_ttl_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        Self {
            id: format!("rn-{}", suffix),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            profile: "NA-915".to_string(),
            profile_file: None,
            max_ingress_bytes: 512 * 1024,
            beacon_interval_ms: 10_000,
            neighbor_ttl_ms: 60_000,
            auto_disable_mock_on_real_link: true,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud: 115_200,
            default_topic: "personal:hub".to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8787".to_string(),
        }
    }
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8788".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: "dev-bridge".to_string(),
            token_next: String::new(),
            require_sig: false,
            sig_tolerance_ms: 2 * 60_000,
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 4_000,
            spool_dir: ".radio-spool".to_string(),
            max_items: 2_000,
            max_bytes: 100 * 1024 * 1024,
            ttl_ms: 7 * 24 * 3600 * 1000,
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            rx_dir: ".rf_spool/rx".to_string(),
            rx_ttl_secs: 3 * 24 * 3600,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            log::info!("config: {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.radio.profile, "NA-915");
        assert_eq!(config.radio.max_ingress_bytes, 512 * 1024);
        assert_eq!(config.serial.baud, 115_200);
        assert_eq!(config.cloud.timeout_ms, 4_000);
        assert_eq!(config.spool.rx_ttl_secs, 3 * 24 * 3600);
        assert!(config.node.id.starts_with("rn-"));
        assert!(config.cloud.base_url.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let toml_content = r#"
[radio]
profile = "EU-868"
max_ingress_bytes = 1024

[serial]
device = "/dev/ttyUSB0"

[auth]
token = "secret"
require_sig = true
"#;
        let config: BridgeConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.radio.profile, "EU-868");
        assert_eq!(config.radio.max_ingress_bytes, 1024);
        // Untouched sections keep their defaults
        assert_eq!(config.radio.beacon_interval_ms, 10_000);
        assert_eq!(config.serial.device, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud, 115_200);
        assert!(config.auth.require_sig);
        assert_eq!(config.auth.sig_tolerance_ms, 2 * 60_000);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = BridgeConfig::default();
        let toml_string = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&toml_string).unwrap();
        assert_eq!(parsed.node.id, config.node.id);
        assert_eq!(parsed.radio.profile, config.radio.profile);
        assert_eq!(parsed.http.bind, config.http.bind);
    }
}
