//! HMAC-SHA256 request signing shared by outbound batch requests and inbound callbacks.
//!
//! - The key is the shared secret `{application_id}.{api_key}`
//! - The signature is computed over the exact body bytes on the wire
//! - The result is the lowercase hex digest, sent in `x-hmac-sha256-signature`

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC of the request body.
pub const SIGNATURE_HEADER: &str = "x-hmac-sha256-signature";

/// Build the shared signing secret from the provider credentials.
pub fn shared_secret(application_id: &str, api_key: &str) -> String {
    format!("{application_id}.{api_key}")
}

/// Sign a body with the shared secret.
///
/// Returns the lowercase hex HMAC-SHA256 digest, or `None` if the key cannot be used.
pub fn sign_payload(payload: &[u8], secret: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex signature against the raw body.
///
/// Comparison is constant-time and case-insensitive on the hex digits.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(expected) = sign_payload(payload, secret) else {
        return false;
    };

    let provided = signature.trim().to_ascii_lowercase();
    constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

/// Constant-time byte comparison to prevent timing attacks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
