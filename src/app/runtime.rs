//! Runtime - configuration-driven lifecycle management
//!
//! The runtime is responsible for:
//! - Restoring persisted counters before anything else runs
//! - Registering one counter per configured proxy
//! - Building relays (`both` runs a TCP and a UDP relay on one counter)
//! - Driving startup, the shutdown signal, and ordered teardown

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::relay::{Relay, TcpRelay, UdpRelay};
use crate::stats::persistence::Persistence;
use crate::stats::{format_bytes, Protocol, StatsManager};

use super::api::ApiServer;

/// Period between durable counter snapshots
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

/// Owns every long-lived component and wires them to the shared registry
pub struct Runtime {
    manager: Arc<StatsManager>,
    relays: Vec<Box<dyn Relay>>,
    persistence: Persistence,
    api: ApiServer,
}

impl Runtime {
    /// Build the runtime from configuration. Loads persisted counters first
    /// so registration reuses them; a corrupt data file logs a warning and
    /// counting starts from zero.
    pub fn from_config(config: &Config) -> Result<Self> {
        let manager = Arc::new(StatsManager::new());

        let persistence = Persistence::new(&config.data_file, manager.clone());
        if let Err(e) = persistence.load() {
            warn!("Failed to load persisted counters: {}", e);
        }

        let mut relays: Vec<Box<dyn Relay>> = Vec::new();
        for proxy in &config.proxies {
            let limit = proxy.limit_bytes()?;
            let limit_monthly = proxy.limit_monthly_bytes()?;

            let stats = manager.register(
                &proxy.name,
                proxy.protocol,
                proxy.listen_port,
                proxy.target_port,
                limit,
                limit_monthly,
            );

            if limit > 0 {
                info!("[{}] total limit: {}", proxy.name, format_bytes(limit));
            }
            if limit_monthly > 0 {
                info!("[{}] monthly limit: {}", proxy.name, format_bytes(limit_monthly));
            }

            match proxy.protocol {
                Protocol::Tcp => {
                    relays.push(Box::new(TcpRelay::new(
                        &proxy.name,
                        proxy.listen_port,
                        &proxy.target_host,
                        proxy.target_port,
                        stats,
                    )));
                }
                Protocol::Udp => {
                    relays.push(Box::new(UdpRelay::new(
                        &proxy.name,
                        proxy.listen_port,
                        &proxy.target_host,
                        proxy.target_port,
                        stats,
                    )));
                }
                Protocol::Both => {
                    relays.push(Box::new(TcpRelay::new(
                        &proxy.name,
                        proxy.listen_port,
                        &proxy.target_host,
                        proxy.target_port,
                        stats.clone(),
                    )));
                    relays.push(Box::new(UdpRelay::new(
                        &proxy.name,
                        proxy.listen_port,
                        &proxy.target_host,
                        proxy.target_port,
                        stats,
                    )));
                }
            }
        }

        let api = ApiServer::new(config.api.port, &config.api.token, manager.clone());

        Ok(Self {
            manager,
            relays,
            persistence,
            api,
        })
    }

    pub fn manager(&self) -> &Arc<StatsManager> {
        &self.manager
    }

    /// Start everything, block until SIGINT/SIGTERM, then tear down in
    /// order: API first, relays next (listeners close before drain), and
    /// persistence last so the final save sees every increment.
    pub async fn run(&mut self) -> Result<()> {
        for relay in &mut self.relays {
            relay.start().await?;
        }
        self.persistence.start(PERSIST_INTERVAL);
        self.api.start().await?;
        info!("Runtime started with {} relays", self.relays.len());

        wait_for_signal().await?;
        info!("Shutting down...");
        self.shutdown().await;
        info!("Shutdown complete");
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.api.stop().await;
        for relay in &mut self.relays {
            relay.stop().await;
        }
        self.persistence.stop().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
