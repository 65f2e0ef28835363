//! Application hooks for framing, dispatch and lifecycle notifications.

use netcore_wire::{check_block, check_http, HttpMessage, IntegrityResult};
use std::fmt;

use crate::handle::SessionHandle;
use crate::session::CloseReason;

/// Capability set carried by [`crate::traits::SessionTraits`].
///
/// Only [`SessionHandler::dispatch`] is required. The integrity checkers
/// default to the built-in block and HTTP framing; notifications default
/// to no-ops. Every method runs on the engine task and must not block.
pub trait SessionHandler: Send + Sync + fmt::Debug {
    /// Decide whether `buf` starts with a complete TCP unit
    fn check_tcp(&self, buf: &[u8], capacity: usize) -> IntegrityResult {
        check_block(buf, capacity)
    }

    /// Decide whether `buf` starts with a complete HTTP message or chunk
    fn check_http(
        &self,
        buf: &[u8],
        capacity: usize,
        had_header: bool,
        msg: &mut HttpMessage,
    ) -> IntegrityResult {
        check_http(buf, capacity, had_header, msg)
    }

    /// Handle one complete TCP unit; `false` closes the session
    fn dispatch(&self, session: &SessionHandle, block: &[u8]) -> bool;

    /// Handle one complete HTTP message or chunk; `false` closes the session
    fn dispatch_http(&self, session: &SessionHandle, msg: &HttpMessage) -> bool {
        self.dispatch(session, &msg.body)
    }

    /// A connection was established (accepted or connected)
    fn on_linked(&self, _session: &SessionHandle) {}

    /// An outbound connection dropped; the session lives on and may retry
    fn on_disconnected(&self, _session: &SessionHandle, _reason: &CloseReason) {}

    /// The session was removed from the engine; its id is now invalid
    fn on_closed(&self, _session: &SessionHandle, _reason: &CloseReason) {}

    /// Periodic tick for a linked session
    fn on_pulse(&self, _session: &SessionHandle) {}
}
