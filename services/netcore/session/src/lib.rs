//! TCP sessions, admission control, reconnection and the session engine.
//!
//! This crate turns sockets into framed application units and back:
//!
//! - **Session Traits**: per-session options plus a pluggable [`SessionHandler`]
//! - **Accepters**: listening sockets with whitelist and capacity admission
//! - **Sessions**: receive pipeline (decrypt, frame, dispatch) and send queue
//! - **Reconnection**: retry state machine for outbound sessions
//! - **Engine**: [`SessionManager`], a single task that owns all state
//!
//! ## Example
//!
//! ```rust,no_run
//! use netcore_session::{
//!     AccepterExtend, SessionHandle, SessionHandler, SessionManager, SessionTraits,
//! };
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Echo;
//!
//! impl SessionHandler for Echo {
//!     fn dispatch(&self, session: &SessionHandle, block: &[u8]) -> bool {
//!         session.send(bytes::Bytes::copy_from_slice(block)).is_ok()
//!     }
//! }
//!
//! # async fn example() -> netcore_session::Result<()> {
//! let mut manager = SessionManager::new();
//! let traits = SessionTraits::new(Arc::new(Echo));
//! manager
//!     .open_accepter(AccepterExtend::new("0.0.0.0", 7000, traits).max_sessions(100))
//!     .await?;
//! manager.run().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accepter;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod handler;
mod keepalive;
pub mod manager;
pub mod reconnect;
pub mod session;
pub mod traits;
pub mod transport;

// Re-export main types
pub use accepter::{AccepterExtend, Admission, ListenerConfig, DEFAULT_MAX_SESSIONS};
pub use dispatcher::ProtoDispatcher;
pub use error::{Result, SessionError};
pub use handle::{EngineHandle, SendGauge, SessionHandle};
pub use handler::SessionHandler;
pub use manager::{EngineEvent, SessionManager};
pub use reconnect::{ConnectState, ReconnectMachine, Transition};
pub use session::{CloseReason, RecvOutcome, SessionRole, SessionStats, TcpSession};
pub use traits::{ProtoKind, ReconnectPolicy, SessionOptions, SessionTraits, UNLIMITED_RECONNECTS};
pub use transport::{connect_tcp, listen_tcp};
