//! Integrity-check result taxonomy and buffer bounds.
//!
//! Every framer reports one of three outcomes for the bytes buffered so far.
//! `Shortage` carries the number of *additional* bytes the framer needs
//! beyond what is already buffered, never the block total.

use std::fmt;

/// Receive buffer capacity per session (100 KiB)
pub const MAX_BUFF_SIZE: usize = 100 * 1024;

/// Send buffer capacity per session (20 KiB)
pub const MAX_SEND_PACK_SIZE: usize = 20 * 1024;

/// Outcome of one integrity check over an accumulating buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityResult {
    /// A complete unit of this many bytes is at the front of the buffer
    Success(usize),
    /// Incomplete; at least this many more bytes are needed
    Shortage(usize),
    /// The buffered bytes can never form a valid unit; close the socket
    Corruption,
}

impl IntegrityResult {
    /// Whether this is a fatal outcome for the connection
    pub fn is_corruption(&self) -> bool {
        matches!(self, IntegrityResult::Corruption)
    }
}

impl fmt::Display for IntegrityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityResult::Success(n) => write!(f, "SUCCESS({})", n),
            IntegrityResult::Shortage(n) => write!(f, "SHORTAGE({})", n),
            IntegrityResult::Corruption => write!(f, "CORRUPTION"),
        }
    }
}
