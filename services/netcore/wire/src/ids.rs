//! Identifier space for sessions, connectors and accepters.
//!
//! A single `u32` names every session the engine owns. The value space is
//! split at [`SESSION_ID_BOUNDARY`]: ids below it belong to accepted
//! sessions, ids at or above it (except [`INVALID_SESSION_ID`]) belong to
//! outbound connectors. Routing a command therefore never needs a side
//! table to tell the two apart.

/// Session identifier (accepted session or outbound connector)
pub type SessionId = u32;
/// Listening socket identifier
pub type AccepterId = u32;
/// Application protocol number carried in the default block header
pub type ProtoId = u16;

/// Sentinel meaning "no session"
pub const INVALID_SESSION_ID: SessionId = SessionId::MAX;
/// Sentinel meaning "no accepter"
pub const INVALID_ACCEPTER_ID: AccepterId = AccepterId::MAX;
/// Sentinel meaning "no protocol number"
pub const INVALID_PROTO_ID: ProtoId = ProtoId::MAX;

/// First connect id; every id below it is a session id
pub const SESSION_ID_BOUNDARY: u32 = 300 * 1000 * 1000;

/// Whether `id` lies in the accepted-session range
#[inline]
pub fn is_session_id(id: u32) -> bool {
    id < SESSION_ID_BOUNDARY
}

/// Whether `id` lies in the connector range
#[inline]
pub fn is_connect_id(id: u32) -> bool {
    id != INVALID_SESSION_ID && !is_session_id(id)
}

/// Next id in the session range, wrapping to 0 before the boundary
#[inline]
pub fn next_session_id(current: u32) -> u32 {
    current.wrapping_add(1) % SESSION_ID_BOUNDARY
}

/// Next id in the connector range, wrapping to the boundary and never
/// producing the sentinel
#[inline]
pub fn next_connect_id(current: u32) -> u32 {
    let next = current.wrapping_add(1);
    if next < SESSION_ID_BOUNDARY || next == INVALID_SESSION_ID {
        SESSION_ID_BOUNDARY
    } else {
        next
    }
}

/// Owned allocator for the three identifier counters of one engine.
///
/// The allocator only advances; the caller passes a liveness predicate so
/// ids still in use are skipped.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    last_session: SessionId,
    last_connect: SessionId,
    last_accepter: AccepterId,
}

impl IdAllocator {
    /// Create an allocator whose first ids are `0`, the boundary and `0`
    pub fn new() -> Self {
        Self {
            last_session: SESSION_ID_BOUNDARY - 1,
            last_connect: INVALID_SESSION_ID,
            last_accepter: INVALID_ACCEPTER_ID,
        }
    }

    /// Allocate the next free session id.
    ///
    /// Returns `None` when every id in the range is live.
    pub fn alloc_session(&mut self, is_live: impl Fn(SessionId) -> bool) -> Option<SessionId> {
        let mut candidate = self.last_session;
        for _ in 0..SESSION_ID_BOUNDARY {
            candidate = next_session_id(candidate);
            if !is_live(candidate) {
                self.last_session = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Allocate the next free connector id.
    pub fn alloc_connect(&mut self, is_live: impl Fn(SessionId) -> bool) -> Option<SessionId> {
        let mut candidate = self.last_connect;
        for _ in 0..(INVALID_SESSION_ID - SESSION_ID_BOUNDARY) {
            candidate = next_connect_id(candidate);
            if !is_live(candidate) {
                self.last_connect = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Allocate the next free accepter id.
    pub fn alloc_accepter(&mut self, is_live: impl Fn(AccepterId) -> bool) -> Option<AccepterId> {
        let mut candidate = self.last_accepter;
        for _ in 0..INVALID_ACCEPTER_ID {
            candidate = candidate.wrapping_add(1);
            if candidate == INVALID_ACCEPTER_ID {
                candidate = 0;
            }
            if !is_live(candidate) {
                self.last_accepter = candidate;
                return Some(candidate);
            }
        }
        None
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_classification() {
        for id in [0, 1, 12_345, SESSION_ID_BOUNDARY - 1] {
            assert!(is_session_id(id));
            assert!(!is_connect_id(id));
        }
        for id in [SESSION_ID_BOUNDARY, SESSION_ID_BOUNDARY + 1, INVALID_SESSION_ID - 1] {
            assert!(is_connect_id(id));
            assert!(!is_session_id(id));
        }
        assert!(!is_connect_id(INVALID_SESSION_ID));
        assert!(!is_session_id(INVALID_SESSION_ID));
    }

    #[test]
    fn test_session_id_wraps_inside_range() {
        assert_eq!(next_session_id(0), 1);
        assert_eq!(next_session_id(SESSION_ID_BOUNDARY - 1), 0);
    }

    #[test]
    fn test_connect_id_skips_sentinel() {
        assert_eq!(next_connect_id(SESSION_ID_BOUNDARY), SESSION_ID_BOUNDARY + 1);
        assert_eq!(next_connect_id(INVALID_SESSION_ID - 1), SESSION_ID_BOUNDARY);
        assert_eq!(next_connect_id(INVALID_SESSION_ID), SESSION_ID_BOUNDARY);
        // A session-range value never advances into the session range
        assert_eq!(next_connect_id(7), SESSION_ID_BOUNDARY);
    }

    #[test]
    fn test_allocator_skips_live_ids() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc_session(|_| false), Some(0));
        assert_eq!(ids.alloc_session(|id| id == 1 || id == 2), Some(3));

        assert_eq!(ids.alloc_connect(|_| false), Some(SESSION_ID_BOUNDARY));
        assert_eq!(
            ids.alloc_connect(|id| id == SESSION_ID_BOUNDARY + 1),
            Some(SESSION_ID_BOUNDARY + 2)
        );

        assert_eq!(ids.alloc_accepter(|_| false), Some(0));
        assert_eq!(ids.alloc_accepter(|id| id == 1), Some(2));
    }
}
