//! Default length-prefixed block format.
//!
//! This is the framing used when an application does not supply its own
//! TCP integrity checker.
//!
//! ```text
//! +----------------------+-----------------------------------+
//! | u32 block_len (BE)   | total length, header included     |
//! +----------------------+-----------------------------------+
//! | u16 proto_id (BE)    | application protocol number       |
//! +----------------------+-----------------------------------+
//! | payload              | block_len - 6 bytes               |
//! +----------------------+-----------------------------------+
//! ```

use crate::error::WireError;
use crate::ids::ProtoId;
use crate::integrity::IntegrityResult;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Size of the block header in bytes
pub const BLOCK_HEADER_SIZE: usize = 6;

/// Check whether `buf` starts with a complete default-format block.
///
/// `capacity` is the receive buffer bound: a block declaring more than
/// `capacity` bytes is corruption, not a shortage.
pub fn check_block(buf: &[u8], capacity: usize) -> IntegrityResult {
    if capacity < BLOCK_HEADER_SIZE {
        return IntegrityResult::Corruption;
    }

    // Need the length prefix before anything else is known
    if buf.len() < 4 {
        return IntegrityResult::Shortage(BLOCK_HEADER_SIZE - buf.len());
    }

    let block_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if block_len < BLOCK_HEADER_SIZE || block_len > capacity {
        trace!("block declares {} bytes, capacity {}", block_len, capacity);
        return IntegrityResult::Corruption;
    }

    if buf.len() < block_len {
        return IntegrityResult::Shortage(block_len - buf.len());
    }

    IntegrityResult::Success(block_len)
}

/// Read the protocol number of a complete block
pub fn block_proto_id(block: &[u8]) -> Result<ProtoId, WireError> {
    if block.len() < BLOCK_HEADER_SIZE {
        return Err(WireError::Truncated(block.len()));
    }
    Ok(u16::from_be_bytes([block[4], block[5]]))
}

/// Borrow the payload of a complete block
pub fn block_payload(block: &[u8]) -> Result<&[u8], WireError> {
    if block.len() < BLOCK_HEADER_SIZE {
        return Err(WireError::Truncated(block.len()));
    }
    let block_len = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if block_len != block.len() {
        return Err(WireError::Malformed);
    }
    Ok(&block[BLOCK_HEADER_SIZE..])
}

/// Builder for default-format blocks
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    proto_id: ProtoId,
    payload: BytesMut,
}

impl BlockBuilder {
    /// Start a block for `proto_id`
    pub fn new(proto_id: ProtoId) -> Self {
        Self {
            proto_id,
            payload: BytesMut::new(),
        }
    }

    /// Append raw payload bytes
    pub fn payload(mut self, bytes: &[u8]) -> Self {
        self.payload.put_slice(bytes);
        self
    }

    /// Append a big-endian u32
    pub fn put_u32(mut self, value: u32) -> Self {
        self.payload.put_u32(value);
        self
    }

    /// Append a u16 length-prefixed UTF-8 string
    pub fn put_str(mut self, value: &str) -> Self {
        self.payload.put_u16(value.len() as u16);
        self.payload.put_slice(value.as_bytes());
        self
    }

    /// Size of the encoded block
    pub fn encoded_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.payload.len()
    }

    /// Encode the block, refusing anything larger than `max_block`
    pub fn build(self, max_block: usize) -> Result<Bytes, WireError> {
        let total = self.encoded_size();
        if total > max_block || total > u32::MAX as usize {
            return Err(WireError::Size(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u16(self.proto_id);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}
