//! Echo node behaviour: replies to echo and ping blocks, answers HTTP
//! requests, and pings the remote end of every outbound session.

use netcore_session::{CloseReason, ProtoDispatcher, SessionHandle, SessionHandler};
use netcore_wire::{
    build_response, is_connect_id, BlockBuilder, HttpHeaders, HttpMessage, ProtoId,
    MAX_SEND_PACK_SIZE,
};
use tracing::{debug, info, warn};

/// Payload is echoed back unchanged
pub const PROTO_ECHO: ProtoId = 1;
/// Answered with [`PROTO_PONG`] carrying the same payload
pub const PROTO_PING: ProtoId = 2;
/// Reply to [`PROTO_PING`]
pub const PROTO_PONG: ProtoId = 3;

/// Handler installed on every session of the node
#[derive(Debug)]
pub struct EchoHandler {
    routes: ProtoDispatcher,
}

impl EchoHandler {
    /// Handler with the echo, ping and pong routes registered
    pub fn new() -> Self {
        let routes = ProtoDispatcher::new();
        routes.register(PROTO_ECHO, |session, payload| reply(session, PROTO_ECHO, payload));
        routes.register(PROTO_PING, |session, payload| reply(session, PROTO_PONG, payload));
        routes.register(PROTO_PONG, |session, payload| {
            debug!(component = "echo", "Session {} pong ({} bytes)", session.id(), payload.len());
            true
        });
        Self { routes }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Send one block; a full send buffer drops the reply but keeps the session
fn reply(session: &SessionHandle, proto_id: ProtoId, payload: &[u8]) -> bool {
    let block = match BlockBuilder::new(proto_id)
        .payload(payload)
        .build(MAX_SEND_PACK_SIZE)
    {
        Ok(block) => block,
        Err(e) => {
            warn!(component = "echo", "Session {} reply too large: {}", session.id(), e);
            return false;
        }
    };
    match session.send(block) {
        Ok(()) => true,
        Err(e) => {
            warn!(component = "echo", "Session {} reply dropped: {}", session.id(), e);
            true
        }
    }
}

impl SessionHandler for EchoHandler {
    fn dispatch(&self, session: &SessionHandle, block: &[u8]) -> bool {
        self.routes.dispatch(session, block)
    }

    fn dispatch_http(&self, session: &SessionHandle, msg: &HttpMessage) -> bool {
        if msg.is_response() {
            debug!(
                component = "echo",
                "Session {} HTTP response {}",
                session.id(),
                msg.common_line.1
            );
            return true;
        }
        // Chunked requests are answered once the last chunk arrives
        if msg.is_chunked && !msg.is_last_chunk() {
            return true;
        }

        let mut headers = HttpHeaders::new();
        headers.push("Content-Type", "application/octet-stream");
        let response = build_response(200, "OK", &headers, &msg.body);
        if let Err(e) = session.send(response) {
            warn!(component = "echo", "Session {} HTTP reply dropped: {}", session.id(), e);
        }
        true
    }

    fn on_linked(&self, session: &SessionHandle) {
        info!(component = "echo", "Session {} linked with {:?}", session.id(), session.peer());
    }

    fn on_disconnected(&self, session: &SessionHandle, reason: &CloseReason) {
        info!(component = "echo", "Session {} lost its connection: {}", session.id(), reason);
    }

    fn on_closed(&self, session: &SessionHandle, reason: &CloseReason) {
        info!(component = "echo", "Session {} closed: {}", session.id(), reason);
    }

    fn on_pulse(&self, session: &SessionHandle) {
        if !is_connect_id(session.id()) {
            return;
        }
        let stamp = chrono::Utc::now().timestamp_millis().to_be_bytes();
        reply(session, PROTO_PING, &stamp);
    }
}
