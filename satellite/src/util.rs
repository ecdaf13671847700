//! What's a project without a util module.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;

use crate::error::Error;

/// Current wall clock in UTC milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn base64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn base64_decode(value: &str) -> Result<Vec<u8>, Error> {
    BASE64
        .decode(value)
        .map_err(|err| Error::Internal(format!("base64: {}", err)))
}

/// Escape identifiers by doubling any embedded quotes.
pub fn escape_identifier(s: &str) -> String {
    s.replace("\"", "\"\"")
}
