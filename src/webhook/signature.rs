//! # Payload Signing
//!
//! HMAC-SHA256 signatures over webhook payloads, carried in the
//! `X-Sizu-Signature` header as `sha256=<hex digest>`.
//!
//! Signatures are recomputed on every delivery attempt — never cached
//! across retries — so a rotated merchant secret takes effect on the next
//! attempt, not the next event.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header value prefix identifying the digest algorithm.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign `payload` with the merchant's secret.
///
/// Returns the full header value, e.g.
/// `sha256=5d41402abc4b2a76b9719d911017c592...`.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest))
}

/// Verify an inbound signature header against `payload` and `secret`.
///
/// Comparison happens inside `Mac::verify_slice`, which is constant-time;
/// a malformed header or wrong prefix fails without leaking where the
/// mismatch was.
pub fn verify_signature(payload: &[u8], secret: &str, signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time byte comparison for shared secrets.
///
/// Length is compared first (length is not secret); the body comparison
/// touches every byte regardless of where a mismatch occurs.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
