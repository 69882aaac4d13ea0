//! The `GatewayRoute` custom resource and its controller.
//!
//! Any change to any `GatewayRoute` triggers a world rebuild: the full route
//! set is re-materialized from the local cache and atomically replaced in the
//! registry. Routes with a missing `match` or `backend.service_name` are
//! silently dropped.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::proto;
use crate::registry::Registry;

/// `GatewayRoute` spec: group `agw.masallsome.io`, version `v1`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "agw.masallsome.io", version = "v1", kind = "GatewayRoute", namespaced)]
pub struct GatewayRouteSpec {
    /// Path prefix to match, e.g. `/api`.
    #[serde(default, rename = "match")]
    pub match_: String,
    #[serde(default)]
    pub backend: Option<GatewayBackend>,
    #[serde(default)]
    pub plugins: Vec<GatewayPlugin>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GatewayBackend {
    /// Service in the custom resource's own namespace; joined into
    /// `k8s/<namespace>/<service_name>` to reference the discovered cluster.
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GatewayPlugin {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub wasm_path: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Watch `GatewayRoute` resources cluster-wide and rebuild the registry route
/// set on every change.
pub async fn run(client: Client, registry: Arc<Registry>) {
    let api: Api<GatewayRoute> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();

    info!("Starting GatewayRoute watcher");

    let mut cache: HashMap<String, GatewayRoute> = HashMap::new();
    let mut resync: Option<HashMap<String, GatewayRoute>> = None;

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => resync = Some(HashMap::new()),
            Ok(watcher::Event::InitApply(cr)) => {
                if let Some(buffer) = resync.as_mut() {
                    buffer.insert(cache_key(&cr), cr);
                }
            }
            Ok(watcher::Event::InitDone) => {
                if let Some(buffer) = resync.take() {
                    cache = buffer;
                    rebuild(&cache, &registry);
                }
            }
            Ok(watcher::Event::Apply(cr)) => {
                cache.insert(cache_key(&cr), cr);
                rebuild(&cache, &registry);
            }
            Ok(watcher::Event::Delete(cr)) => {
                cache.remove(&cache_key(&cr));
                rebuild(&cache, &registry);
            }
            Err(e) => warn!(error = %e, "GatewayRoute watch error, retrying"),
        }
    }
}

fn cache_key(cr: &GatewayRoute) -> String {
    format!("{}/{}", cr.namespace().unwrap_or_default(), cr.name_any())
}

fn rebuild(cache: &HashMap<String, GatewayRoute>, registry: &Registry) {
    let mut keys: Vec<&String> = cache.keys().collect();
    keys.sort();

    let routes: Vec<proto::Route> =
        keys.iter().filter_map(|key| parse_route(&cache[*key])).collect();

    info!(count = routes.len(), "Rebuilt routes from GatewayRoute resources");
    registry.set_crd_routes(routes);
}

/// Translate one custom resource into a wire route, or `None` if it is not
/// well-formed enough to route traffic.
pub(crate) fn parse_route(cr: &GatewayRoute) -> Option<proto::Route> {
    let spec = &cr.spec;
    if spec.match_.is_empty() {
        return None;
    }
    let backend = spec.backend.as_ref()?;
    if backend.service_name.is_empty() {
        return None;
    }

    let namespace = cr.namespace().unwrap_or_default();
    let cluster_id = format!("k8s/{}/{}", namespace, backend.service_name);

    Some(proto::Route {
        path_prefix: spec.match_.clone(),
        domain: String::new(),
        cluster_id,
        plugins: spec
            .plugins
            .iter()
            .map(|p| proto::Plugin {
                name: p.name.clone(),
                wasm_path: p.wasm_path.clone(),
                config: p.config.clone(),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_route(namespace: &str, name: &str, spec: GatewayRouteSpec) -> GatewayRoute {
        let mut cr = GatewayRoute::new(name, spec);
        cr.metadata.namespace = Some(namespace.to_string());
        cr
    }

    #[test]
    fn test_parse_route() {
        let cr = gateway_route(
            "default",
            "api-route",
            GatewayRouteSpec {
                match_: "/api".to_string(),
                backend: Some(GatewayBackend {
                    service_name: "my-svc".to_string(),
                    port: None,
                }),
                plugins: vec![GatewayPlugin {
                    name: "deny-curl".to_string(),
                    wasm_path: "/etc/agw/deny.wasm".to_string(),
                    config: HashMap::new(),
                }],
            },
        );

        let route = parse_route(&cr).unwrap();
        assert_eq!(route.path_prefix, "/api");
        assert_eq!(route.cluster_id, "k8s/default/my-svc");
        assert_eq!(route.plugins.len(), 1);
    }

    #[test]
    fn test_route_without_match_dropped() {
        let cr = gateway_route(
            "default",
            "bad",
            GatewayRouteSpec {
                match_: String::new(),
                backend: Some(GatewayBackend {
                    service_name: "my-svc".to_string(),
                    port: None,
                }),
                plugins: Vec::new(),
            },
        );
        assert!(parse_route(&cr).is_none());
    }

    #[test]
    fn test_route_without_backend_dropped() {
        let cr = gateway_route(
            "default",
            "bad",
            GatewayRouteSpec { match_: "/api".to_string(), backend: None, plugins: Vec::new() },
        );
        assert!(parse_route(&cr).is_none());
    }

    #[test]
    fn test_rebuild_is_deterministic_and_replaces() {
        let registry = Registry::new();
        let mut cache = HashMap::new();
        for (ns, name, path) in
            [("default", "b-route", "/b"), ("default", "a-route", "/a")]
        {
            let cr = gateway_route(
                ns,
                name,
                GatewayRouteSpec {
                    match_: path.to_string(),
                    backend: Some(GatewayBackend {
                        service_name: "svc".to_string(),
                        port: None,
                    }),
                    plugins: Vec::new(),
                },
            );
            cache.insert(cache_key(&cr), cr);
        }

        rebuild(&cache, &registry);
        let routes = registry.list_routes();
        let prefixes: Vec<&str> = routes.iter().map(|r| r.path_prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/a", "/b"]);

        cache.remove("default/a-route");
        rebuild(&cache, &registry);
        assert_eq!(registry.list_routes().len(), 1);
    }
}
