//! Expiry decoding from a JWT-shaped bearer token.
//!
//! Only the payload segment is read; the signature is never checked here.
//! Verification belongs to the issuing service.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Read the `exp` claim (seconds since epoch) from the token's payload.
///
/// Returns `None` for opaque tokens, malformed payloads, or payloads without
/// a numeric `exp`.
pub fn payload_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    // Some issuers pad their segments even though JWT says not to
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.exp?;
    if !exp.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((exp * 1000.0) as i64).single()
}
