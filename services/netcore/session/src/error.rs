//! Session and engine error types.

use netcore_wire::{AccepterId, SessionId, WireError};
use thiserror::Error;

use crate::reconnect::ConnectState;

/// Errors surfaced by the session layer and the engine
#[derive(Error, Debug)]
pub enum SessionError {
    /// I/O failure on a listener or socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level failure while building or transforming bytes
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// No live session carries this id
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// No open accepter carries this id
    #[error("unknown accepter {0}")]
    UnknownAccepter(AccepterId),

    /// Every identifier of the requested range is live
    #[error("identifier space exhausted")]
    IdsExhausted,

    /// Send buffer would exceed its bound; retry once pending bytes drain
    #[error("send buffer full: {pending} pending, {requested} requested")]
    Backpressure {
        /// Bytes already queued
        pending: usize,
        /// Bytes the caller tried to add
        requested: usize,
    },

    /// A single block larger than the whole send buffer
    #[error("block of {0} bytes exceeds the send buffer")]
    OversizedBlock(usize),

    /// Reconnection state machine asked to take an impossible edge
    #[error("invalid transition from {from:?} on {event}")]
    InvalidTransition {
        /// State the machine was in
        from: ConnectState,
        /// Event that was applied
        event: &'static str,
    },

    /// Connector configured without a usable remote address
    #[error("invalid remote address {0:?}")]
    InvalidRemote(String),

    /// Engine task is gone
    #[error("engine stopped")]
    EngineStopped,
}

/// Type alias for Results using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;
