//! Block hash primitive
//!
//! The canonical serialization is fixed for the lifetime of a chain:
//!
//! ```text
//! hex(SHA-256(decimal(index) || timestamp || from || to || payload || prev_hash))
//! ```
//!
//! Fields are concatenated without separators, in exactly this order, and the
//! timestamp is the stored ISO-8601 text, never a re-rendered value.

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// Compute the hash of a block from its fields
pub fn calculate_hash(
    index: u64,
    timestamp: &str,
    from: &str,
    to: &str,
    payload: &str,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(from.as_bytes());
    hasher.update(to.as_bytes());
    hasher.update(payload.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Current wall-clock time as ISO-8601 UTC with millisecond precision,
/// e.g. `2024-05-01T12:00:00.123Z`
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
