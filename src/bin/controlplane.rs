//! AGW control plane: merges file and Kubernetes configuration into versioned
//! snapshots and streams them to connected data planes.

use std::sync::Arc;

use tracing::{info, warn};

use agw::config::{ConfigWatcher, ControlPlaneConfig};
use agw::registry::Registry;
use agw::xds::{run_broadcast_loop, start_xds_server, XdsState};
use agw::{k8s, observability, AgwError, Result};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_logging();

    info!(app_name = agw::APP_NAME, version = agw::VERSION, "Starting AGW control plane");

    let settings = ControlPlaneConfig::from_env()?;

    let registry = Arc::new(Registry::new());
    let registry_dirty = registry
        .take_dirty_receiver()
        .ok_or_else(|| AgwError::internal("registry dirty receiver already taken"))?;

    // Static file pipeline. A missing or broken file disables reloads but
    // does not stop the process; the empty snapshot is served until the file
    // shows up on a restart.
    let (watcher, file_updates) = ConfigWatcher::new(settings.config_path.clone());
    tokio::spawn(async move {
        if let Err(e) = watcher.run().await {
            warn!(error = %e, "Config watcher stopped");
        }
    });

    // Kubernetes discovery is optional: without a reachable cluster the CP
    // serves file-only snapshots.
    match k8s::try_client().await {
        Ok(client) => k8s::spawn_controllers(client, registry.clone()),
        Err(e) => warn!(error = %e, "Kubernetes discovery disabled"),
    }

    let state = Arc::new(XdsState::new(registry));
    tokio::spawn(run_broadcast_loop(state.clone(), file_updates, registry_dirty));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    start_xds_server(state, &settings.bind_address(), shutdown).await
}
