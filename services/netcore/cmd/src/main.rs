//! netcore echo node.
//!
//! Opens the configured accepters and connectors on one session engine.
//! Accepted sessions echo blocks (or answer HTTP requests); outbound
//! sessions ping their peer on every pulse.

use clap::Parser;
use netcore_session::{
    AccepterExtend, ListenerConfig, ProtoKind, SessionHandler, SessionManager, SessionOptions,
    SessionTraits,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::{error, info};

mod config;
mod echo;
mod logging;

use config::NetcoreConfig;
use echo::EchoHandler;

/// netcore echo node
#[derive(Parser, Debug)]
#[command(name = "netcore", version, about = "Echo node for the netcore session engine")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:7000 (replaces the first configured listener)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Connect to address, e.g. 127.0.0.1:7000 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Configuration file path
    #[arg(long, default_value = "netcore.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the file
    #[arg(long)]
    log_level: Option<String>,

    /// Pulse interval for sessions created from flags, e.g. 30s
    #[arg(long, default_value = "30s")]
    pulse_interval: humantime::Duration,

    /// Speak HTTP instead of binary blocks on sessions created from flags
    #[arg(long)]
    http: bool,

    /// RC4 key for sessions created from flags
    #[arg(long)]
    rc4_key: Option<String>,

    /// Concurrent session cap for the flag listener
    #[arg(long)]
    max_sessions: Option<u32>,

    /// Permitted peer IP for the flag listener (repeatable)
    #[arg(long)]
    whitelist: Vec<String>,

    /// Reconnect attempts for flag connectors (0 disables, 4294967295 is unlimited)
    #[arg(long, default_value = "5")]
    reconnect_attempts: u32,

    /// Delay between reconnect attempts, e.g. 5s
    #[arg(long, default_value = "5s")]
    reconnect_interval: humantime::Duration,
}

impl Args {
    /// Session options shared by everything created from flags
    fn session_options(&self) -> SessionOptions {
        let mut options = SessionOptions {
            proto: if self.http {
                ProtoKind::Http
            } else {
                ProtoKind::Tcp
            },
            pulse_interval_ms: self.pulse_interval.as_millis() as u64,
            ..Default::default()
        };
        if let Some(key) = &self.rc4_key {
            options.rc4_key = key.clone();
        }
        options.reconnect.max_attempts = self.reconnect_attempts;
        options.reconnect.interval_ms = self.reconnect_interval.as_millis() as u64;
        options
    }

    /// Fold flags into the loaded configuration
    fn apply(&self, config: &mut NetcoreConfig) {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }

        let template = self.session_options();
        if let Some(addr) = self.listen {
            config.set_primary_listener(addr);
            if let Some(listener) = config.listeners.first_mut() {
                listener.session = template.clone();
                if let Some(max) = self.max_sessions {
                    listener.max_sessions = max;
                }
                if !self.whitelist.is_empty() {
                    listener.whitelist = self.whitelist.clone();
                }
            }
        }
        for addr in &self.connect {
            config.add_connector(*addr, &template);
        }
    }
}

async fn open_listener(
    manager: &mut SessionManager,
    listener: &ListenerConfig,
    handler: Arc<dyn SessionHandler>,
) -> anyhow::Result<()> {
    let extend = AccepterExtend::from_config(listener, handler);
    let id = manager.open_accepter(extend).await?;
    if let Some(accepter) = manager.accepter(id) {
        info!(component = "engine", "Accepter {}: {}", id, accepter);
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Config loading logs through a scoped subscriber until the configured
    // level is known
    let bootstrap_level = args.log_level.as_deref().unwrap_or("info");
    let bootstrap = logging::subscriber(bootstrap_level)?;
    let mut config = tracing::subscriber::with_default(bootstrap, || {
        NetcoreConfig::load_from_file(&args.config)
    })?;
    args.apply(&mut config);
    logging::init(&config.log_level)?;

    info!("Starting netcore v{}", env!("CARGO_PKG_VERSION"));

    if config.listeners.is_empty() && config.connectors.is_empty() {
        anyhow::bail!("nothing to do: configure a listener or a connector");
    }

    let handler: Arc<dyn SessionHandler> = Arc::new(EchoHandler::new());
    let mut manager = SessionManager::new();

    for listener in &config.listeners {
        open_listener(&mut manager, listener, handler.clone()).await?;
    }
    for options in &config.connectors {
        let traits = SessionTraits::with_options(options.clone(), handler.clone());
        let id = manager.connect(traits)?;
        info!(component = "engine", "Connector {} started: {}", id, options);
    }

    let engine = manager.handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        let _ = engine.stop();
    });

    manager.run().await;
    info!("netcore stopped");
    Ok(())
}
