//! Owns the running configuration generation and swaps it on reload

use crate::config::{self, Config};
use crate::dns_server::{DnsServer, RunningServer};
use crate::plugin::SharedState;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

pub struct Supervisor {
    address: SocketAddr,
    server: DnsServer,
    running: RunningServer,
    reload_rx: watch::Receiver<bool>,
}

/// Parses a generation from disk, or from the built-in allow-list when no
/// path is configured.
fn load_generation(config_path: &Option<String>) -> Result<DnsServer> {
    let shared = Arc::new(SharedState::new(config_path.clone()));
    let cfg = match config_path {
        Some(path) => Config::load(path, shared.clone())?,
        None => Config::parse(config::DEFAULT_COREFILE, shared.clone())?,
    };
    for zone_config in &cfg.zones {
        info!("Server block {} loaded with {} plugins", zone_config.name, zone_config.plugins.len());
    }
    DnsServer::new(cfg, shared)
}

impl Supervisor {
    /// Loads and binds the first generation. Any failure here is fatal.
    pub async fn start(config_path: Option<String>, address: SocketAddr) -> Result<Self> {
        let server = load_generation(&config_path).context("Failed to load configuration")?;
        let reload_rx = server.shared().take_reload_rx()?;
        let listeners = server.bind(address).await?;
        let running = server.start(listeners);
        Ok(Self { address, server, running, reload_rx })
    }

    /// Swaps in a freshly loaded generation. A configuration that fails to
    /// load is logged and the current generation keeps serving; returns
    /// whether the swap happened.
    pub async fn reload(&mut self) -> Result<bool> {
        let next = match load_generation(&self.server.shared().config_path) {
            Ok(next) => next,
            Err(e) => {
                error!("Reload rejected, keeping current configuration: {:#}", e);
                return Ok(false);
            }
        };
        let reload_rx = next.shared().take_reload_rx()?;

        std::mem::take(&mut self.running).stop().await;

        let listeners = next.bind(self.address).await?;
        self.running = next.start(listeners);
        self.server = next;
        self.reload_rx = reload_rx;
        info!("Configuration reloaded");
        Ok(true)
    }

    /// Serves until Ctrl-C, reloading whenever the current generation asks.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                changed = self.reload_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    info!("Reloading configuration");
                    self.reload().await?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down");
                    break;
                }
            }
        }
        self.running.stop().await;
        Ok(())
    }
}
