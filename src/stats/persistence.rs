//! Crash-safe persistence of the counter registry
//!
//! Snapshots are serialized as an indented JSON mapping `name → counter
//! fields` with sorted keys, so diffs between snapshots stay meaningful.
//! Every save writes `<path>.tmp` and renames it over `<path>`: under crash
//! or power loss the data file is either the previous complete snapshot or
//! the new one, never a truncated hybrid.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{Error, Result};

use super::{PersistedStats, ProxyStats, StatsManager};

/// Background saver for a `StatsManager`
pub struct Persistence {
    path: PathBuf,
    manager: Arc<StatsManager>,
    stop_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl Persistence {
    pub fn new(path: impl Into<PathBuf>, manager: Arc<StatsManager>) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            path: path.into(),
            manager,
            stop_tx,
            task: None,
        }
    }

    /// Restore counters from the data file into the registry. A missing file
    /// is not an error; a file that exists but does not parse is.
    ///
    /// Must be called before any relay starts.
    pub fn load(&self) -> Result<()> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let entries: HashMap<String, PersistedStats> = serde_json::from_str(&data)
            .map_err(|e| {
                Error::Persistence(format!("failed to parse {}: {}", self.path.display(), e))
            })?;

        let restored = entries
            .into_iter()
            .map(|(name, persisted)| {
                let stats = Arc::new(ProxyStats::from_persisted(name.clone(), persisted));
                (name, stats)
            })
            .collect();
        self.manager.replace_all(restored);

        info!("Loaded traffic counters from {}", self.path.display());
        Ok(())
    }

    /// Write a snapshot of every counter to the data file.
    pub fn save(&self) -> Result<()> {
        save_snapshot(&self.path, &self.manager)
    }

    /// Spawn the background task that saves every `interval`, logging save
    /// errors without exiting, until `stop`.
    pub fn start(&mut self, interval: Duration) {
        let path = self.path.clone();
        let manager = self.manager.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval fires immediately; the first tick is not a save
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = save_snapshot(&path, &manager) {
                            error!("Failed to save traffic counters: {}", e);
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        }));
    }

    /// Cancel the background task, wait for it, then save one last time.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        match self.save() {
            Ok(()) => info!("Traffic counters saved to {}", self.path.display()),
            Err(e) => error!("Failed to save traffic counters on shutdown: {}", e),
        }
    }
}

fn save_snapshot(path: &Path, manager: &StatsManager) -> Result<()> {
    let snapshot = manager.snapshot();
    let entries: BTreeMap<&str, PersistedStats> = snapshot
        .iter()
        .map(|(name, stats)| (name.as_str(), stats.snapshot()))
        .collect();

    let data = serde_json::to_string_pretty(&entries)
        .map_err(|e| Error::Persistence(e.to_string()))?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
