//! AGW data plane: terminates HTTP(S), routes to upstream clusters and runs
//! per-route Wasm plugin chains.

use std::sync::Arc;

use tracing::info;

use agw::config::DataPlaneConfig;
use agw::dataplane::resources::ResourcePools;
use agw::dataplane::{new_handle, GatewayService, ListenerManager, SnapshotConsumer};
use agw::observability;
use agw::wasm::PluginEngine;

#[tokio::main]
async fn main() -> agw::Result<()> {
    observability::init_logging();

    info!(app_name = agw::APP_NAME, version = agw::VERSION, "Starting AGW data plane");

    let settings = DataPlaneConfig::from_env();

    let pools = Arc::new(ResourcePools::new());
    let engine = Arc::new(PluginEngine::new(pools.clone())?);
    let _epoch_ticker = engine.start_epoch_ticker();

    let active = new_handle();
    let service = GatewayService::new(active.clone(), engine.clone());
    let listeners = ListenerManager::new(service);

    let consumer =
        SnapshotConsumer::new(settings, active, engine, pools, listeners);

    tokio::select! {
        _ = consumer.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    Ok(())
}
