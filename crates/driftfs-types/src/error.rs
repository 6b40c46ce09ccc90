use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("content id length {0} out of range (1..=65535)")]
    IdLengthOutOfRange(usize),

    #[error("invalid slice id: {0}")]
    InvalidSliceId(String),
}
