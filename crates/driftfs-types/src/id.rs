use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Opaque identifier for a single logical file's payload.
///
/// A `ContentId` is assigned by the metadata layer (it is typically a file
/// handle) and never interpreted by the cache. It must be between 1 and
/// 65535 bytes so it fits the log's length-prefixed framing.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(Vec<u8>);

impl ContentId {
    /// Maximum handle length the on-disk log can frame.
    pub const MAX_LEN: usize = u16::MAX as usize;

    /// Create a `ContentId` from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, TypeError> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > Self::MAX_LEN {
            return Err(TypeError::IdLengthOutOfRange(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// Create a `ContentId` from a byte slice, copying it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypeError> {
        Self::new(bytes.to_vec())
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::new(bytes)
    }

    /// The raw handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Handle length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`: the constructor rejects empty handles.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex-encoded string representation. This is the textual form used
    /// for content-store keys.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Short hex representation (first 8 characters, or fewer for tiny ids).
    pub fn short_hex(&self) -> String {
        let n = self.0.len().min(4);
        hex::encode(&self.0[..n])
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.short_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
