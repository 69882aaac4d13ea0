//! Shared control-plane state: the static snapshot, the last merged snapshot,
//! and the set of connected subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::empty_snapshot;
use crate::proto;
use crate::registry::Registry;

struct StateInner {
    static_snapshot: proto::ConfigSnapshot,
    current: Option<proto::ConfigSnapshot>,
    subscribers: HashMap<u64, mpsc::Sender<proto::ConfigSnapshot>>,
    next_id: u64,
}

/// Control-plane snapshot state. All mutation happens under one mutex; the
/// broadcast fanout uses non-blocking sends so a stalled subscriber never
/// backs up the merge loop.
pub struct XdsState {
    registry: Arc<Registry>,
    inner: Mutex<StateInner>,
}

impl XdsState {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(StateInner {
                static_snapshot: empty_snapshot(),
                current: None,
                subscribers: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Replace the file-loaded base snapshot.
    pub fn set_static_snapshot(&self, snapshot: proto::ConfigSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.static_snapshot = snapshot;
    }

    /// The last merged snapshot, if any broadcast has happened yet.
    pub fn current(&self) -> Option<proto::ConfigSnapshot> {
        self.inner.lock().unwrap().current.clone()
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Register a subscriber. The returned capacity-1 receiver yields merged
    /// snapshots; if a current snapshot exists it is delivered from a detached
    /// task so registration itself never blocks.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<proto::ConfigSnapshot>) {
        let (tx, rx) = mpsc::channel(1);

        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx.clone());

        if let Some(current) = inner.current.clone() {
            tokio::spawn(async move {
                let _ = tx.send(current).await;
            });
        }

        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.remove(&id);
    }

    /// Merge the static snapshot with registry state and push the result to
    /// every subscriber.
    ///
    /// Merge order is static-first for routes and clusters, so file-declared
    /// configuration always takes match precedence over CRD-derived routes.
    /// Routes whose cluster cannot be resolved inside the merged snapshot and
    /// listeners whose TLS secret is unknown are dropped from the outgoing
    /// snapshot with a warning; the stored static config is never mutated.
    pub fn rebuild_and_broadcast(&self) {
        let mut inner = self.inner.lock().unwrap();

        let crd_routes = self.registry.list_routes();
        let k8s_clusters = self.registry.list_clusters();

        let mut clusters: Vec<proto::Cluster> = Vec::new();
        let mut cluster_names: HashSet<String> = HashSet::new();
        for cluster in inner.static_snapshot.clusters.iter().chain(k8s_clusters.iter()) {
            if cluster_names.insert(cluster.name.clone()) {
                clusters.push(cluster.clone());
            } else {
                warn!(cluster = %cluster.name, "Duplicate cluster name in merge, keeping first");
            }
        }

        let resources = inner.static_snapshot.resources.as_ref().map(dedupe_resources);

        let mut routes: Vec<proto::Route> = Vec::new();
        for route in inner.static_snapshot.routes.iter().chain(crd_routes.iter()) {
            if cluster_names.contains(&route.cluster_id) {
                routes.push(route.clone());
            } else {
                warn!(
                    path_prefix = %route.path_prefix,
                    cluster_id = %route.cluster_id,
                    "Dropping route with unresolved cluster reference"
                );
            }
        }

        let mut listeners: Vec<proto::Listener> = Vec::new();
        for listener in &inner.static_snapshot.listeners {
            let mut resolved = listener.clone();
            if let Some(tls) = &listener.tls {
                if tls.secret_name.is_empty() && tls.cert_pem.is_empty() {
                    warn!(listener = %listener.name, "Dropping TLS listener without secret reference");
                    continue;
                }
                if !tls.secret_name.is_empty() {
                    match self.registry.get_secret(&tls.secret_name) {
                        Some(secret) => {
                            resolved.tls = Some(proto::TlsConfig {
                                secret_name: tls.secret_name.clone(),
                                cert_pem: secret.cert,
                                key_pem: secret.key,
                            });
                        }
                        None => {
                            warn!(
                                listener = %listener.name,
                                secret = %tls.secret_name,
                                "Dropping listener with unresolved TLS secret"
                            );
                            continue;
                        }
                    }
                }
            }
            listeners.push(resolved);
        }

        let version_id = format!(
            "{}-k8s-{}",
            inner.static_snapshot.version_id,
            Utc::now().format("%H%M%S")
        );

        let snapshot = proto::ConfigSnapshot {
            version_id: version_id.clone(),
            listeners,
            routes,
            clusters,
            resources,
        };

        inner.current = Some(snapshot.clone());

        if !inner.subscribers.is_empty() {
            info!(
                version = %version_id,
                routes = snapshot.routes.len(),
                clusters = snapshot.clusters.len(),
                listeners = snapshot.listeners.len(),
                subscribers = inner.subscribers.len(),
                "Broadcasting merged snapshot"
            );
        } else {
            debug!(version = %version_id, "Rebuilt snapshot with no subscribers");
        }

        for (id, tx) in &inner.subscribers {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id, "Subscriber channel full, skipping update");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The stream task unregisters itself on disconnect.
                }
            }
        }
    }
}

fn dedupe_resources(resources: &proto::ExternalResources) -> proto::ExternalResources {
    let mut out = proto::ExternalResources::default();
    let mut seen = HashSet::new();
    for redis in &resources.redis {
        if seen.insert(redis.name.clone()) {
            out.redis.push(redis.clone());
        } else {
            warn!(name = %redis.name, "Duplicate redis resource name, keeping first");
        }
    }
    seen.clear();
    for db in &resources.databases {
        if seen.insert(db.name.clone()) {
            out.databases.push(db.clone());
        } else {
            warn!(name = %db.name, "Duplicate database resource name, keeping first");
        }
    }
    out
}

/// Main control-plane event loop: rebuild and broadcast on either a file
/// reload or a registry dirty signal.
pub async fn run_broadcast_loop(
    state: Arc<XdsState>,
    mut file_updates: mpsc::Receiver<proto::ConfigSnapshot>,
    mut registry_dirty: mpsc::Receiver<()>,
) {
    // Seed the current snapshot so a data plane connecting before any file or
    // Kubernetes event still receives the (possibly empty) configuration.
    state.rebuild_and_broadcast();

    loop {
        tokio::select! {
            maybe_snapshot = file_updates.recv() => match maybe_snapshot {
                Some(snapshot) => {
                    info!(version = %snapshot.version_id, "Static config updated");
                    state.set_static_snapshot(snapshot);
                    state.rebuild_and_broadcast();
                }
                None => {
                    info!("Config watcher channel closed, stopping broadcast loop");
                    break;
                }
            },
            maybe_dirty = registry_dirty.recv() => match maybe_dirty {
                Some(()) => state.rebuild_and_broadcast(),
                None => {
                    info!("Registry dirty channel closed, stopping broadcast loop");
                    break;
                }
            },
        }
    }
}
