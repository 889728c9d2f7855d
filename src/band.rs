//! Band profiles: the (MTU, send rate) pair describing the active link
//!
//! Every queue and fragment size in the daemon derives from the active
//! profile. Profiles are selected by name at startup and never change while
//! the process runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Link capacity parameters for one radio band
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BandProfile {
    /// Maximum transmission unit in bytes (whole frame, header included)
    pub mtu: usize,
    /// Nominal frame release rate in Hz
    pub rate_hz: f64,
}

impl BandProfile {
    /// Nominal spacing between released frames
    pub fn pacing_interval(&self) -> Duration {
        if self.rate_hz <= 0.0 {
            return Duration::from_millis(1000);
        }
        Duration::from_millis((1000.0 / self.rate_hz) as u64)
    }
}

/// Built-in profile table
pub fn builtin_profiles() -> BTreeMap<String, BandProfile> {
    let mut map = BTreeMap::new();
    map.insert("NA-915".to_string(), BandProfile { mtu: 180, rate_hz: 10.0 });
    map.insert("EU-868".to_string(), BandProfile { mtu: 51, rate_hz: 6.0 });
    map.insert("ISM-2.4".to_string(), BandProfile { mtu: 200, rate_hz: 20.0 });
    map
}

/// Load the profile table, replacing the built-ins with the contents of
/// `path` when it parses as a non-empty `name -> {mtu, rate_hz}` map.
/// A missing or malformed file falls back to the built-in table.
pub fn load_profiles(path: Option<&Path>) -> BTreeMap<String, BandProfile> {
    let Some(path) = path else {
        return builtin_profiles();
    };
    match std::fs::read_to_string(path) {
        Ok(text) => match toml::from_str::<BTreeMap<String, BandProfile>>(&text) {
            Ok(map) if !map.is_empty() => map,
            Ok(_) => {
                log::warn!("band: profile file {} is empty, using built-ins", path.display());
                builtin_profiles()
            }
            Err(e) => {
                log::warn!("band: bad profile file {}: {}, using built-ins", path.display(), e);
                builtin_profiles()
            }
        },
        Err(e) => {
            log::warn!("band: cannot read {}: {}, using built-ins", path.display(), e);
            builtin_profiles()
        }
    }
}

/// Select a profile by name, falling back to NA-915
pub fn select(profiles: &BTreeMap<String, BandProfile>, name: &str) -> BandProfile {
    if let Some(p) = profiles.get(name) {
        return *p;
    }
    log::warn!("band: unknown profile {:?}, falling back to NA-915", name);
    profiles
        .get("NA-915")
        .copied()
        .unwrap_or(BandProfile { mtu: 180, rate_hz: 10.0 })
}
