//! # Utilities Module
//!
//! Small helpers shared by the correlator, the normalizer and the daemon:
//! char-boundary-safe truncation for log lines, SHA-256 digests for dedup keys,
//! and timestamp formatting.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

/// Returns at most `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Lower-case hex SHA-256 of `input`, cut to `hex_len` characters.
pub fn sha256_hex(input: &str, hex_len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(hex_len);
    encoded
}

/// Current UTC time in RFC 9557 form with millisecond precision.
pub fn current_datetime_rfc9557() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Interprets a host timestamp (epoch seconds or milliseconds) as UTC.
pub fn datetime_from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    // Anything past year 2286 in seconds is really milliseconds.
    if raw > 9_999_999_999 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}
