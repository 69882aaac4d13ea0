//! # Config File Watcher
//!
//! Watches the static YAML file and re-loads it on change. Parsed snapshots
//! are delivered through a bounded channel with a non-blocking send: a slow
//! consumer drops intermediate versions instead of stalling the watcher.

use std::path::PathBuf;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::loader::load_config;
use crate::errors::{AgwError, Result};
use crate::proto;

/// Watches one configuration file for writes and emits parsed snapshots.
pub struct ConfigWatcher {
    path: PathBuf,
    updates_tx: mpsc::Sender<proto::ConfigSnapshot>,
}

impl ConfigWatcher {
    /// Create a watcher for `path`. The returned receiver yields a snapshot
    /// for the initial load and for every successful reload after a change.
    pub fn new(path: PathBuf) -> (Self, mpsc::Receiver<proto::ConfigSnapshot>) {
        let (updates_tx, updates_rx) = mpsc::channel(10);
        (Self { path, updates_tx }, updates_rx)
    }

    /// Run until the consumer side is dropped. Parse errors keep the previous
    /// snapshot: nothing is emitted and the watcher keeps going.
    pub async fn run(self) -> Result<()> {
        self.reload();

        let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Result<notify::Event>>(16);
        let mut watcher = notify::recommended_watcher(move |res| {
            // Runs on notify's own thread; a full channel just drops the event
            // and a later write will trigger another reload.
            let _ = raw_tx.try_send(res);
        })
        .map_err(|e| AgwError::config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                AgwError::config(format!("Failed to watch {}: {}", self.path.display(), e))
            })?;

        info!(path = %self.path.display(), "Watching config file");

        while let Some(event) = raw_rx.recv().await {
            match event {
                Ok(ev) if matches!(ev.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                    info!(path = %self.path.display(), "Config file modified");
                    self.reload();
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "File watcher error"),
            }

            if self.updates_tx.is_closed() {
                break;
            }
        }

        Ok(())
    }

    fn reload(&self) {
        match load_config(&self.path) {
            Ok(snapshot) => {
                let version = snapshot.version_id.clone();
                match self.updates_tx.try_send(snapshot) {
                    Ok(()) => info!(version = %version, "Config reloaded"),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Update channel full, dropping config reload")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "Error reloading config"),
        }
    }
}
