//! Listening socket configuration and admission control.

use netcore_wire::{AccepterId, INVALID_ACCEPTER_ID};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::{Result, SessionError};
use crate::handler::SessionHandler;
use crate::traits::{SessionOptions, SessionTraits};

/// Default cap on concurrently linked sessions per accepter
pub const DEFAULT_MAX_SESSIONS: u32 = 5000;

/// Serializable accepter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to bind
    pub listen_ip: String,
    /// Port to bind; 0 picks an ephemeral port
    pub listen_port: u16,
    /// Concurrent session cap
    pub max_sessions: u32,
    /// Permitted peer IPs; empty permits all
    pub whitelist: Vec<String>,
    /// Options cloned into every accepted session
    pub session: SessionOptions,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 0,
            max_sessions: DEFAULT_MAX_SESSIONS,
            whitelist: Vec::new(),
            session: SessionOptions::default(),
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone)]
pub enum Admission {
    /// Peer admitted; carries the traits for the new session
    Accepted(SessionTraits),
    /// Peer IP not on the whitelist
    RejectedWhitelist,
    /// Concurrent session cap reached
    RejectedCapacity,
}

/// Listening socket configuration plus its admission counters
#[derive(Debug, Clone)]
pub struct AccepterExtend {
    /// Assigned when the accepter is opened
    pub id: AccepterId,
    /// Bound address
    pub listen_ip: String,
    /// Bound port
    pub listen_port: u16,
    /// Concurrent session cap
    pub max_sessions: u32,
    /// Permitted peer IPs; empty permits all
    pub whitelist: Vec<String>,
    /// Connections that passed the whitelist check
    pub total_accept_count: u64,
    /// Sessions currently alive from this accepter
    pub current_linked: u64,
    /// Connections refused by the whitelist
    pub rejected_whitelist: u64,
    /// Connections refused by the session cap
    pub rejected_capacity: u64,
    /// Template cloned into each accepted session
    pub session_traits: SessionTraits,
}

impl AccepterExtend {
    /// Accepter for `listen_ip:listen_port` with default limits
    pub fn new(
        listen_ip: impl Into<String>,
        listen_port: u16,
        session_traits: SessionTraits,
    ) -> Self {
        Self {
            id: INVALID_ACCEPTER_ID,
            listen_ip: listen_ip.into(),
            listen_port,
            max_sessions: DEFAULT_MAX_SESSIONS,
            whitelist: Vec::new(),
            total_accept_count: 0,
            current_linked: 0,
            rejected_whitelist: 0,
            rejected_capacity: 0,
            session_traits,
        }
    }

    /// Accepter built from configuration
    pub fn from_config(config: &ListenerConfig, handler: Arc<dyn SessionHandler>) -> Self {
        let traits = SessionTraits::with_options(config.session.clone(), handler);
        let mut extend = Self::new(config.listen_ip.clone(), config.listen_port, traits);
        extend.max_sessions = config.max_sessions;
        extend.whitelist = config.whitelist.clone();
        extend
    }

    /// Set the concurrent session cap
    pub fn max_sessions(mut self, max_sessions: u32) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the whitelist
    pub fn whitelist<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = ips.into_iter().map(Into::into).collect();
        self
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_ip
            .parse()
            .map_err(|_| SessionError::InvalidRemote(self.listen_ip.clone()))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Whether `peer_ip` passes the whitelist
    pub fn permits(&self, peer_ip: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.iter().any(|ip| ip == peer_ip)
    }

    /// Run admission for one inbound connection and update counters.
    ///
    /// Whitelist is checked first, then capacity. Traits are cloned only
    /// for admitted peers.
    pub fn admit(&mut self, peer_ip: &str) -> Admission {
        if !self.permits(peer_ip) {
            self.rejected_whitelist += 1;
            return Admission::RejectedWhitelist;
        }

        self.total_accept_count += 1;
        if self.current_linked >= u64::from(self.max_sessions) {
            self.rejected_capacity += 1;
            return Admission::RejectedCapacity;
        }

        self.current_linked += 1;
        Admission::Accepted(self.session_traits.clone())
    }

    /// An admitted session went away
    pub fn release(&mut self) {
        self.current_linked = self.current_linked.saturating_sub(1);
    }
}

impl fmt::Display for AccepterExtend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ accepter_id={}, listen_ip={}, listen_port={}, max_sessions={}, whitelist=[{}], \
             total_accept_count={}, current_linked={}, rejected_whitelist={}, \
             rejected_capacity={}, session_traits={} }}",
            self.id,
            self.listen_ip,
            self.listen_port,
            self.max_sessions,
            self.whitelist.join(","),
            self.total_accept_count,
            self.current_linked,
            self.rejected_whitelist,
            self.rejected_capacity,
            self.session_traits
        )
    }
}
