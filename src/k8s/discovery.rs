//! Service discovery: EndpointSlice and Service watchers.
//!
//! EndpointSlices carry the actual pod addresses; Services only matter on
//! deletion, when the corresponding cluster is removed. Discovered clusters
//! use the `k8s/<namespace>/<service>` naming convention so CRD-derived routes
//! can reference them by that exact key.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::proto;
use crate::registry::Registry;

/// Label linking an EndpointSlice to its owning Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Watch EndpointSlices cluster-wide and project them into registry clusters.
pub async fn run_endpoint_slice_watcher(client: Client, registry: Arc<Registry>) {
    let api: Api<EndpointSlice> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();

    info!("Starting EndpointSlice watcher");

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(slice)) | Ok(watcher::Event::InitApply(slice)) => {
                if let Some(cluster) = cluster_from_slice(&slice) {
                    debug!(
                        cluster = %cluster.name,
                        endpoints = cluster.endpoints.len(),
                        "EndpointSlice applied"
                    );
                    registry.upsert_cluster(cluster);
                }
            }
            Ok(watcher::Event::Delete(slice)) => {
                // Slice deletion leaves an empty-endpoint cluster behind so
                // routes referencing it fail with 502 rather than 404.
                if let Some(name) = slice_cluster_name(&slice) {
                    debug!(cluster = %name, "EndpointSlice deleted, clearing endpoints");
                    registry.upsert_cluster(proto::Cluster { name, endpoints: Vec::new() });
                }
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(e) => warn!(error = %e, "EndpointSlice watch error, retrying"),
        }
    }
}

/// Watch Services cluster-wide; deletion removes the matching cluster.
pub async fn run_service_watcher(client: Client, registry: Arc<Registry>) {
    let api: Api<Service> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();

    info!("Starting Service watcher");

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Delete(service)) => {
                let namespace = service.namespace().unwrap_or_default();
                let name = format!("k8s/{}/{}", namespace, service.name_any());
                debug!(cluster = %name, "Service deleted");
                registry.delete_cluster(&name);
            }
            Ok(_) => {
                // Endpoint membership transitions are slice-driven.
            }
            Err(e) => warn!(error = %e, "Service watch error, retrying"),
        }
    }
}

fn slice_cluster_name(slice: &EndpointSlice) -> Option<String> {
    let service = slice.labels().get(SERVICE_NAME_LABEL)?;
    if service.is_empty() {
        return None;
    }
    let namespace = slice.namespace().unwrap_or_default();
    Some(format!("k8s/{}/{}", namespace, service))
}

/// Translate a slice into a cluster of its *ready* addresses. Endpoints whose
/// readiness condition is explicitly false are filtered out; the port defaults
/// to 80 when the slice declares none.
pub(crate) fn cluster_from_slice(slice: &EndpointSlice) -> Option<proto::Cluster> {
    let name = slice_cluster_name(slice)?;

    let port = slice
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .and_then(|p| p.port)
        .map(|p| p as u32)
        .unwrap_or(80);

    let mut endpoints = Vec::new();
    for endpoint in &slice.endpoints {
        if endpoint.conditions.as_ref().and_then(|c| c.ready) == Some(false) {
            continue;
        }
        let Some(address) = endpoint.addresses.first() else {
            continue;
        };
        endpoints.push(proto::Endpoint { address: address.clone(), port });
    }

    Some(proto::Cluster { name, endpoints })
}
