//! HMAC-SHA256 request signing.
//!
//! Used in both directions: outbound webhook deliveries are signed with the
//! subscriber's secret, inbound gateway callbacks are verified against the
//! configured callback key. The signature is the hex HMAC-SHA256 of the raw
//! body followed by the decimal Unix timestamp sent in `X-Timestamp`.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Hex HMAC-SHA256 of `body + timestamp`. `None` if the key is unusable.
pub fn sign(signing_key: &str, body: &[u8], timestamp: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes()).ok()?;
    mac.update(body);
    mac.update(timestamp.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signed request.
///
/// # Arguments
///
/// * `signing_key` - Shared secret
/// * `body` - Raw request body, exactly as received
/// * `timestamp` - The `X-Timestamp` header (Unix epoch seconds)
/// * `signature` - The `X-Signature` header
/// * `max_age_seconds` - Maximum allowed clock distance (prevents replay)
pub fn verify_signature(
    signing_key: &str,
    body: &[u8],
    timestamp: &str,
    signature: &str,
    max_age_seconds: u64,
) -> bool {
    if signing_key.is_empty() || timestamp.is_empty() || signature.is_empty() {
        warn!(
            has_signing_key = !signing_key.is_empty(),
            has_timestamp = !timestamp.is_empty(),
            has_signature = !signature.is_empty(),
            "signature_missing_fields"
        );
        return false;
    }

    let signed_at: u64 = match timestamp.parse() {
        Ok(t) => t,
        Err(_) => {
            warn!(timestamp = %timestamp, "signature_invalid_timestamp");
            return false;
        }
    };

    let current_time = unix_now();
    let age = current_time.abs_diff(signed_at);
    if age > max_age_seconds {
        warn!(
            signed_at = signed_at,
            current_time = current_time,
            age_seconds = age,
            max_age_seconds = max_age_seconds,
            "signature_stale"
        );
        return false;
    }

    let Some(expected) = sign(signing_key, body, timestamp) else {
        warn!("signature_invalid_key");
        return false;
    };

    let valid = constant_time_compare(&expected, &signature.to_ascii_lowercase());
    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = signature.len(),
            "signature_mismatch"
        );
    }
    valid
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check if signature verification is enabled for `signing_key`.
pub fn is_signature_verification_enabled(signing_key: &Option<String>) -> bool {
    signing_key
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}
