//! Per-session configuration.
//!
//! [`SessionOptions`] is the plain, serializable part of a session's
//! configuration. [`SessionTraits`] pairs it with the pluggable
//! [`SessionHandler`]; it is cloned into every session an accepter creates
//! and into every connector. Runtime counters are not stored here, they
//! live in [`crate::reconnect::ReconnectMachine`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::handler::SessionHandler;

/// Reconnect attempts value meaning "retry forever"
pub const UNLIMITED_RECONNECTS: u32 = u32::MAX;

/// Application protocol spoken on the byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtoKind {
    /// Binary blocks framed by the TCP integrity checker
    #[default]
    Tcp,
    /// HTTP/1.x framed by the HTTP integrity checker
    Http,
}

impl fmt::Display for ProtoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoKind::Tcp => write!(f, "TCP"),
            ProtoKind::Http => write!(f, "HTTP"),
        }
    }
}

/// Retry policy for outbound sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated; 0 disables reconnection
    pub max_attempts: u32,
    /// Wait between a failure and the next attempt, in milliseconds
    pub interval_ms: u64,
    /// Drop queued outbound data when a live connection is lost
    pub clean_all_data: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            interval_ms: 5000,
            clean_all_data: true,
        }
    }
}

impl ReconnectPolicy {
    /// Reconnection interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Serializable session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Protocol framing used on this session
    pub proto: ProtoKind,
    /// RC4 key for the byte stream; empty disables encryption
    pub rc4_key: String,
    /// Answer legacy cross-domain policy requests
    pub open_flash_policy: bool,
    /// Disable Nagle's algorithm on the socket
    pub no_delay: bool,
    /// Pulse interval in milliseconds; 0 disables pulses
    pub pulse_interval_ms: u64,
    /// Retry policy (outbound sessions only)
    pub reconnect: ReconnectPolicy,
    /// Remote address (outbound sessions only)
    pub remote_ip: String,
    /// Remote port (outbound sessions only)
    pub remote_port: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            proto: ProtoKind::Tcp,
            rc4_key: String::new(),
            open_flash_policy: false,
            no_delay: true,
            pulse_interval_ms: 30000,
            reconnect: ReconnectPolicy::default(),
            remote_ip: String::new(),
            remote_port: 0,
        }
    }
}

impl SessionOptions {
    /// Pulse interval as a duration, `None` when disabled
    pub fn pulse_interval(&self) -> Option<Duration> {
        if self.pulse_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.pulse_interval_ms))
        }
    }

    /// Whether the byte stream is RC4-transformed
    pub fn is_encrypted(&self) -> bool {
        !self.rc4_key.is_empty()
    }

    /// Parsed remote address of an outbound session
    pub fn remote_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .remote_ip
            .parse()
            .map_err(|_| SessionError::InvalidRemote(self.remote_ip.clone()))?;
        if self.remote_port == 0 {
            return Err(SessionError::InvalidRemote(format!("{}:0", self.remote_ip)));
        }
        Ok(SocketAddr::new(ip, self.remote_port))
    }
}

/// Session configuration plus the handler that frames and dispatches
#[derive(Debug, Clone)]
pub struct SessionTraits {
    /// Plain configuration values
    pub options: SessionOptions,
    /// Framing and dispatch capability shared by every clone
    pub handler: Arc<dyn SessionHandler>,
}

impl SessionTraits {
    /// Traits with default options
    pub fn new(handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            options: SessionOptions::default(),
            handler,
        }
    }

    /// Traits with explicit options
    pub fn with_options(options: SessionOptions, handler: Arc<dyn SessionHandler>) -> Self {
        Self { options, handler }
    }

    /// Set the remote endpoint for an outbound session
    pub fn remote(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.options.remote_ip = ip.into();
        self.options.remote_port = port;
        self
    }

    /// Set the reconnection policy
    pub fn reconnect(
        mut self,
        max_attempts: u32,
        interval: Duration,
        clean_all_data: bool,
    ) -> Self {
        self.options.reconnect = ReconnectPolicy {
            max_attempts,
            interval_ms: interval.as_millis() as u64,
            clean_all_data,
        };
        self
    }
}

impl fmt::Display for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ proto_type={}, rc4_encryption={}, open_flash_policy={}, no_delay={}, \
             pulse_interval={}, reconnect_max_count={}, reconnect_interval={}, \
             reconnect_clean_all_data={}, remote_ip={}, remote_port={} }}",
            self.proto,
            if self.is_encrypted() { "on" } else { "off" },
            self.open_flash_policy,
            self.no_delay,
            self.pulse_interval_ms,
            self.reconnect.max_attempts,
            self.reconnect.interval_ms,
            self.reconnect.clean_all_data,
            self.remote_ip,
            self.remote_port
        )
    }
}

impl fmt::Display for SessionTraits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.options.fmt(f)
    }
}
