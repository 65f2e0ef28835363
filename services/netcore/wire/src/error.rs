//! Wire error types.

use thiserror::Error;

/// Errors produced while building or reading wire blocks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Block would exceed the allowed size
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Block shorter than its own header
    #[error("truncated block: {0} bytes")]
    Truncated(usize),

    /// Declared length does not match the bytes supplied
    #[error("malformed block")]
    Malformed,

    /// Stream cipher key is empty or too long
    #[error("invalid rc4 key length: {0}")]
    KeyLength(usize),
}
