//! Bridge authentication: shared token plus optional HMAC signature
//!
//! A request authenticates with a bearer/header/query token. It may also
//! carry a signature `v1,<tsMs>,<hmacHex>` where the MAC is
//! HMAC-SHA256(token, "ws-bridge|<tsMs>"). A present signature must verify
//! against the same token that matched, inside a bounded clock-skew window;
//! an absent signature is accepted unless `require_sig` is set. Two tokens
//! (current + next) are honored so tokens can rotate without downtime.

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Constant-time string equality (length leaks, contents do not)
fn secure_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Compute the hex MAC for a signature at `ts_ms`
pub fn sign(token: &str, ts_ms: u64) -> String {
    let mut mac = HmacSha256::new_from_slice(token.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("ws-bridge|{}", ts_ms).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build a full `v1,<ts>,<machex>` signature header value
pub fn make_sig(token: &str, ts_ms: u64) -> String {
    format!("v1,{},{}", ts_ms, sign(token, ts_ms))
}

/// Validate a `v1,<ts>,<machex>` signature against one token
pub fn valid_sig(sig: &str, token: &str, now_ms: u64, tolerance_ms: u64) -> bool {
    let mut parts = sig.splitn(3, ',');
    let (Some(version), Some(ts_str), Some(mac_hex)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if version != "v1" {
        return false;
    }
    let Ok(ts) = ts_str.parse::<u64>() else {
        return false;
    };
    if now_ms.abs_diff(ts) > tolerance_ms {
        return false;
    }
    let Ok(mac_bytes) = hex::decode(mac_hex) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(token.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("ws-bridge|{}", ts).as_bytes());
    mac.verify_slice(&mac_bytes).is_ok()
}

/// Does the offered token match the current or next configured token?
fn token_matches_any(cfg: &AuthConfig, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    secure_eq(token, &cfg.token) || (!cfg.token_next.is_empty() && secure_eq(token, &cfg.token_next))
}

/// Validate a token with an optional signature.
///
/// A present signature must verify against the specific token that matched.
pub fn token_ok(cfg: &AuthConfig, token: &str, sig: Option<&str>, now_ms: u64) -> bool {
    if token.is_empty() {
        return false;
    }
    match sig {
        Some(sig) if !sig.is_empty() => {
            (secure_eq(token, &cfg.token) && valid_sig(sig, &cfg.token, now_ms, cfg.sig_tolerance_ms))
                || (!cfg.token_next.is_empty()
                    && secure_eq(token, &cfg.token_next)
                    && valid_sig(sig, &cfg.token_next, now_ms, cfg.sig_tolerance_ms))
        }
        _ => token_matches_any(cfg, token),
    }
}

/// Authorize a bridge request.
///
/// `TokenNotConfigured` when no token is set at all; `Unauthorized` on a
/// missing/bad token, a bad signature, or a missing signature under
/// `require_sig`.
pub fn authorize(cfg: &AuthConfig, token: &str, sig: Option<&str>, now_ms: u64) -> Result<()> {
    if cfg.token.is_empty() && cfg.token_next.is_empty() {
        return Err(Error::TokenNotConfigured);
    }
    let has_sig = sig.map(|s| !s.is_empty()).unwrap_or(false);
    if cfg.require_sig && !has_sig {
        return Err(Error::Unauthorized);
    }
    if token_ok(cfg, token, sig, now_ms) {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}
