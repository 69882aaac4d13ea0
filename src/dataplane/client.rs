//! Snapshot consumer: the data plane's long-lived connection to the control
//! plane, with reconnect backoff and the per-snapshot apply sequence.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::DataPlaneConfig;
use crate::dataplane::resources::SharedPools;
use crate::errors::{AgwError, Result};
use crate::proto;
use crate::proto::agw_service_client::AgwServiceClient;
use crate::wasm::PluginEngine;

use super::listeners::ListenerManager;
use super::snapshot::{sanitize, ActiveHandle, ActiveSnapshot};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Receives snapshots and applies them: validate, pre-compile plugins,
/// reconcile pools, atomically publish, reconcile listeners.
pub struct SnapshotConsumer {
    config: DataPlaneConfig,
    active: ActiveHandle,
    engine: Arc<PluginEngine>,
    pools: SharedPools,
    listeners: ListenerManager,
    backoff: Duration,
}

impl SnapshotConsumer {
    pub fn new(
        config: DataPlaneConfig,
        active: ActiveHandle,
        engine: Arc<PluginEngine>,
        pools: SharedPools,
        listeners: ListenerManager,
    ) -> Self {
        Self { config, active, engine, pools, listeners, backoff: INITIAL_BACKOFF }
    }

    /// Reconnect loop. Until the first snapshot arrives no listener is bound,
    /// so the data plane accepts no traffic.
    pub async fn run(mut self) {
        loop {
            match self.stream_once().await {
                Ok(()) => info!("Config stream ended, reconnecting"),
                Err(e) => warn!(error = %e, "Control plane connection failed"),
            }
            tokio::time::sleep(self.backoff).await;
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn stream_once(&mut self) -> Result<()> {
        info!(url = %self.config.control_plane_url, "Connecting to control plane");
        let mut client =
            AgwServiceClient::connect(self.config.control_plane_url.clone()).await?;

        let request = tonic::Request::new(proto::Node {
            id: self.config.node_id.clone(),
            region: self.config.region.clone(),
            version: crate::VERSION.to_string(),
        });

        let mut stream = client
            .stream_config(request)
            .await
            .map_err(|status| {
                AgwError::transport(format!("stream handshake failed: {}", status))
            })?
            .into_inner();

        info!(node_id = %self.config.node_id, "Config stream established");
        self.backoff = INITIAL_BACKOFF;

        while let Some(snapshot) = stream
            .message()
            .await
            .map_err(|status| AgwError::transport(format!("stream error: {}", status)))?
        {
            self.apply(snapshot).await;
        }

        Ok(())
    }

    /// Apply one snapshot to the hot path.
    pub async fn apply(&mut self, snapshot: proto::ConfigSnapshot) {
        info!(
            version = %snapshot.version_id,
            listeners = snapshot.listeners.len(),
            routes = snapshot.routes.len(),
            clusters = snapshot.clusters.len(),
            "Applying config snapshot"
        );

        let sanitized = sanitize(snapshot);

        // Compile before publication so the first request through a new
        // plugin does not pay (or repeat) the compile on the hot path.
        self.engine.preload(&sanitized);
        self.pools.reconcile(sanitized.resources.as_ref());

        let active = Arc::new(ActiveSnapshot::new(sanitized));
        self.active.store(Some(active.clone()));

        self.listeners.reconcile(&active.snapshot.listeners).await;
    }
}
