//! Identifier space, integrity checking and stream transforms for netcore.
//!
//! This crate holds everything the engine needs to turn an accumulating
//! receive buffer into application units without touching a socket:
//!
//! - **Identifier Space**: session / connect id ranges and an owned allocator
//! - **Integrity Result**: the `Success` / `Shortage` / `Corruption` taxonomy
//! - **Block Framing**: the default length-prefixed TCP block format
//! - **HTTP Framing**: incremental HTTP/1.x parsing with chunked bodies
//! - **RC4**: optional keystream transform applied to the byte stream
//!
//! ## Default Block Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 block_len        | whole block, header incl.  |
//! +----------------------+----------------------------+
//! | u16 proto_id         | application protocol       |
//! +----------------------+----------------------------+
//! | payload              | block_len - 6 bytes        |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod error;
pub mod http;
pub mod ids;
pub mod integrity;
pub mod rc4;

// Re-export main types
pub use block::{block_payload, block_proto_id, check_block, BlockBuilder, BLOCK_HEADER_SIZE};
pub use error::WireError;
pub use http::{build_response, check_http, HttpHeaders, HttpMessage};
pub use ids::{
    is_connect_id, is_session_id, next_connect_id, next_session_id, AccepterId, IdAllocator,
    ProtoId, SessionId, INVALID_ACCEPTER_ID, INVALID_PROTO_ID, INVALID_SESSION_ID,
    SESSION_ID_BOUNDARY,
};
pub use integrity::{IntegrityResult, MAX_BUFF_SIZE, MAX_SEND_PACK_SIZE};
pub use rc4::Rc4;
