//! # Kubernetes controllers
//!
//! Watchers translating cluster state into [`Registry`](crate::registry::Registry)
//! mutations: EndpointSlices become clusters, `GatewayRoute` custom resources
//! become routes, and TLS Secrets become certificate material for listener
//! resolution. Each watcher is restartable; a full resync reaches the same
//! steady state as the event stream it replaces.

pub mod discovery;
pub mod gateway_routes;
pub mod secrets;

use std::sync::Arc;

use tracing::info;

use crate::errors::Result;
use crate::registry::Registry;

pub use gateway_routes::{GatewayBackend, GatewayPlugin, GatewayRoute, GatewayRouteSpec};

/// Build a client from the ambient environment: `KUBECONFIG`, then in-cluster
/// config, then `~/.kube/config`. Failure disables Kubernetes discovery.
pub async fn try_client() -> Result<kube::Client> {
    let client = kube::Client::try_default().await?;
    Ok(client)
}

/// Spawn all controllers against a shared registry.
pub fn spawn_controllers(client: kube::Client, registry: Arc<Registry>) {
    info!("Starting Kubernetes discovery controllers");
    tokio::spawn(discovery::run_endpoint_slice_watcher(client.clone(), registry.clone()));
    tokio::spawn(discovery::run_service_watcher(client.clone(), registry.clone()));
    tokio::spawn(gateway_routes::run(client.clone(), registry.clone()));
    tokio::spawn(secrets::run(client, registry));
}
