//! Protocol-number routing for default-format blocks.

use netcore_wire::{block_payload, block_proto_id, ProtoId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::handle::SessionHandle;
use crate::handler::SessionHandler;

type RouteFn = dyn Fn(&SessionHandle, &[u8]) -> bool + Send + Sync + 'static;

/// [`SessionHandler`] that routes each block to the closure registered for
/// its protocol number.
///
/// Routes receive the block payload. Blocks with an unregistered protocol
/// number are logged and dropped; the session stays open.
#[derive(Clone, Default)]
pub struct ProtoDispatcher {
    routes: Arc<RwLock<HashMap<ProtoId, Box<RouteFn>>>>,
}

impl ProtoDispatcher {
    /// Dispatcher with no routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the route for `proto_id`
    pub fn register<F>(&self, proto_id: ProtoId, route: F)
    where
        F: Fn(&SessionHandle, &[u8]) -> bool + Send + Sync + 'static,
    {
        let mut routes = match self.routes.write() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };
        routes.insert(proto_id, Box::new(route));
    }

    /// Whether a route exists for `proto_id`
    pub fn is_registered(&self, proto_id: ProtoId) -> bool {
        match self.routes.read() {
            Ok(routes) => routes.contains_key(&proto_id),
            Err(poisoned) => poisoned.into_inner().contains_key(&proto_id),
        }
    }
}

impl fmt::Debug for ProtoDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.routes.read().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("ProtoDispatcher")
            .field("routes", &count)
            .finish()
    }
}

impl SessionHandler for ProtoDispatcher {
    fn dispatch(&self, session: &SessionHandle, block: &[u8]) -> bool {
        let (proto_id, payload) = match (block_proto_id(block), block_payload(block)) {
            (Ok(proto_id), Ok(payload)) => (proto_id, payload),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Session {} delivered malformed block: {}", session.id(), e);
                return false;
            }
        };

        let routes = match self.routes.read() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };

        match routes.get(&proto_id) {
            Some(route) => route(session, payload),
            None => {
                debug!(
                    "Session {} sent unregistered proto {} ({} bytes), ignoring",
                    session.id(),
                    proto_id,
                    payload.len()
                );
                true
            }
        }
    }
}
