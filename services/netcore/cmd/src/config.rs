//! Configuration handling for the netcore node.
//!
//! Configuration comes from an optional YAML file, then environment
//! overrides, then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use netcore_session::{ListenerConfig, SessionOptions};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetcoreConfig {
    /// Log level for the netcore crates
    pub log_level: String,
    /// Listening sockets
    pub listeners: Vec<ListenerConfig>,
    /// Outbound sessions; each needs `remote_ip` and `remote_port`
    pub connectors: Vec<SessionOptions>,
}

impl Default for NetcoreConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listeners: Vec::new(),
            connectors: Vec::new(),
        }
    }
}

impl NetcoreConfig {
    /// Load configuration from `path` and the process environment.
    ///
    /// A missing file yields defaults; a malformed file is an error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) => {
                warn!("Config file {:?} not readable ({}), using defaults", path, e);
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `NETCORE_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(level) = lookup("NETCORE_LOG_LEVEL") {
            info!("Log level overridden by environment: {}", level);
            self.log_level = level;
        }

        if let Some(listen) = lookup("NETCORE_LISTEN") {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("NETCORE_LISTEN is not an address: {}", listen))?;
            self.set_primary_listener(addr);
            info!("Listen address overridden by environment: {}", addr);
        }

        if let Some(max) = lookup("NETCORE_MAX_SESSIONS") {
            let max: u32 = max
                .parse()
                .with_context(|| format!("NETCORE_MAX_SESSIONS is not a number: {}", max))?;
            for listener in &mut self.listeners {
                listener.max_sessions = max;
            }
        }

        Ok(())
    }

    /// Replace the address of the first listener, adding one if none exist
    pub fn set_primary_listener(&mut self, addr: SocketAddr) {
        match self.listeners.first_mut() {
            Some(listener) => {
                listener.listen_ip = addr.ip().to_string();
                listener.listen_port = addr.port();
            }
            None => self.listeners.push(ListenerConfig {
                listen_ip: addr.ip().to_string(),
                listen_port: addr.port(),
                ..Default::default()
            }),
        }
    }

    /// Add an outbound session to `addr` using `template` for everything else
    pub fn add_connector(&mut self, addr: SocketAddr, template: &SessionOptions) {
        self.connectors.push(SessionOptions {
            remote_ip: addr.ip().to_string(),
            remote_port: addr.port(),
            ..template.clone()
        });
    }
}
