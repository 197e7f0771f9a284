use crate::attestation::errors::AttnError;
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use ring::digest::{digest, SHA256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Formats a SHA-256 digest as uppercase colon-separated hex.
pub fn sha256_fingerprint(data: &[u8]) -> String {
    let d = digest(&SHA256, data);
    let mut out = String::with_capacity(d.as_ref().len() * 3);
    for (idx, byte) in d.as_ref().iter().enumerate() {
        if idx > 0 {
            out.push(':');
        }
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

/// Canonical form of a fingerprint given by an operator: uppercase, colon-separated.
pub fn normalize_fingerprint(fp: &str) -> String {
    let compact: String = fp
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    compact
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Constant-time comparison for equal-length byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Seconds since the Unix epoch; times before the epoch clamp to zero.
pub fn unix_secs(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Decode a hex string that may optionally be prefixed with `0x`.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(hex_str.trim().trim_start_matches("0x"))
}

/// Base64-decodes `value`, tagging errors with the provided label.
pub fn decode_b64(label: &str, value: &str) -> Result<Vec<u8>, AttnError> {
    b64.decode(value.as_bytes())
        .map_err(|e| AttnError::malformed(format!("{label}: {e}")))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    b64.encode(bytes)
}
