//! # xDS pipeline
//!
//! The control plane's snapshot pipeline: merge the static file snapshot with
//! the registry's Kubernetes state, resolve TLS secret references, and fan the
//! result out to every connected data plane over a server-streaming gRPC.

mod server;
mod state;

use std::future::Future;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::info;

use crate::errors::{AgwError, Result};
use crate::proto::agw_service_server::AgwServiceServer;

pub use server::AgwServiceImpl;
pub use state::{run_broadcast_loop, XdsState};

/// Start the snapshot gRPC server with graceful shutdown.
pub async fn start_xds_server<F>(
    state: Arc<XdsState>,
    bind_address: &str,
    shutdown_signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = bind_address
        .parse()
        .map_err(|e| AgwError::config(format!("Invalid xDS address '{}': {}", bind_address, e)))?;

    let service = AgwServiceImpl::new(state);

    info!(address = %addr, "Starting AGW control plane gRPC server");

    Server::builder()
        .add_service(AgwServiceServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal)
        .await
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("Address already in use") || message.contains("bind") {
                AgwError::transport(format!(
                    "xDS server failed to bind to {}: the port is already in use",
                    addr
                ))
            } else {
                AgwError::transport(format!("xDS server failed: {}", e))
            }
        })
}
