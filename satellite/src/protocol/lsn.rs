//! Server log positions.

use bytes::Bytes;

use crate::error::Error;
use crate::util::{base64_decode, base64_encode};

/// Opaque server-assigned position in the replication log.
/// Ordering is bytewise, which matches the server's encoding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn {
    bytes: Bytes,
}

impl Lsn {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Base64 form stored under the `lsn` meta key.
    pub fn encode(&self) -> String {
        base64_encode(&self.bytes)
    }

    pub fn decode(raw: &str) -> Result<Self, Error> {
        Ok(Self::new(base64_decode(raw)?))
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl From<Vec<u8>> for Lsn {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}
