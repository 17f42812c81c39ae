//! Canonical JSON encoding and SHA-256 digests.
//!
//! Ledger entry hashes and replay fingerprints are both computed over the
//! canonical form, so two logically identical values always hash the same:
//!
//! - object keys sorted by byte order
//! - compact separators, non-ASCII left unescaped
//! - floats with no fractional part inside the `i64` range collapse to integers
//!   (`1.0` and `1` encode identically); every other number is printed the way
//!   `serde_json` prints it

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// `prev_entry_hash` of the first ledger entry in every session.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// 2^63 as an exact float, the exclusive upper bound of `i64`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// 2^64 as an exact float, the exclusive upper bound of `u64`.
const U64_BOUND: f64 = 18_446_744_073_709_551_616.0;

/// Rewrite a value into canonical shape (sorted keys, normalized numbers).
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => normalize_number(n),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => {
            // Sort explicitly: `Map` preserves insertion order when serde_json's
            // `preserve_order` feature is unified in from elsewhere.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect();
            Value::Object(sorted)
        }
        other => other.clone(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn normalize_number(n: &Number) -> Value {
    if n.is_i64() || n.is_u64() {
        return Value::Number(n.clone());
    }
    // In range and integral, so each cast is exact.
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f >= -I64_BOUND && f < I64_BOUND => {
            Value::from(f as i64)
        }
        Some(f) if f.is_finite() && f.fract() == 0.0 && f >= I64_BOUND && f < U64_BOUND => {
            Value::from(f as u64)
        }
        _ => Value::Number(n.clone()),
    }
}

/// Encode a value in canonical form.
pub fn encode(value: &Value) -> String {
    normalize(value).to_string()
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 of the canonical encoding of `value`.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(encode(value).as_bytes())
}

/// Whether `s` looks like a digest produced by [`sha256_hex`].
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
