use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Wire length of a slice identifier.
pub const SLICE_ID_LEN: usize = 36;

/// Identifier for a single cached write.
///
/// On disk a slice id occupies exactly 36 ASCII bytes (the hyphenated UUID
/// form); shorter ids are zero-padded in the log and trimmed on decode.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceId(String);

impl SliceId {
    /// Generate a fresh random slice id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Parse a slice id, validating length and character set.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.is_empty() || s.len() > SLICE_ID_LEN {
            return Err(TypeError::InvalidSliceId(format!(
                "length {} out of range (1..={SLICE_ID_LEN})",
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(TypeError::InvalidSliceId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SliceId({})", self.0)
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference from a slice to a content block.
///
/// Carried through the log for format fidelity; the write path leaves the
/// list empty and recovery preserves whatever the log holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block identifier (at most 255 bytes on the wire).
    pub id: String,
    /// Referenced block size in bytes.
    pub size: u32,
}
