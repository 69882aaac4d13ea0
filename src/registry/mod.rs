//! # Registry
//!
//! The control plane's in-memory projection of Kubernetes-discovered state:
//! clusters (from EndpointSlices), routes (from `GatewayRoute` CRDs) and TLS
//! secrets. Every mutation goes through a single lock and emits one coalesced
//! dirty signal — at most one notification is ever pending, and a slow
//! consumer can never stall a watcher.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::proto;

/// TLS material cached from a Kubernetes Secret.
#[derive(Debug, Clone)]
pub struct TlsSecret {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

#[derive(Default)]
struct RegistryInner {
    clusters: HashMap<String, proto::Cluster>,
    routes: Vec<proto::Route>,
    secrets: HashMap<String, TlsSecret>,
}

/// Thread-safe projection of discovered state with a capacity-1 dirty channel.
pub struct Registry {
    inner: RwLock<RegistryInner>,
    dirty_tx: mpsc::Sender<()>,
    dirty_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl Registry {
    pub fn new() -> Self {
        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            dirty_tx,
            dirty_rx: std::sync::Mutex::new(Some(dirty_rx)),
        }
    }

    /// Hand the single dirty-signal consumer end to the broadcast loop.
    /// Subsequent calls return `None`.
    pub fn take_dirty_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.dirty_rx.lock().unwrap().take()
    }

    fn notify(&self) {
        // Non-blocking: a full channel means a notification is already
        // pending, which is all the consumer needs to know.
        let _ = self.dirty_tx.try_send(());
    }

    /// Insert or replace a cluster keyed by its unique name.
    pub fn upsert_cluster(&self, cluster: proto::Cluster) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.clusters.insert(cluster.name.clone(), cluster);
        }
        self.notify();
    }

    pub fn delete_cluster(&self, name: &str) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.clusters.remove(name);
        }
        self.notify();
    }

    /// Whole-list replacement of the CRD-derived route set.
    pub fn set_crd_routes(&self, routes: Vec<proto::Route>) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.routes = routes;
        }
        self.notify();
    }

    /// Store TLS material; empty buffers are rejected by the caller contract
    /// (the secret controller only forwards non-empty cert/key pairs).
    pub fn upsert_secret(&self, name: &str, cert: Vec<u8>, key: Vec<u8>) {
        if cert.is_empty() || key.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.write().unwrap();
            inner.secrets.insert(name.to_string(), TlsSecret { cert, key });
        }
        self.notify();
    }

    pub fn delete_secret(&self, name: &str) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.secrets.remove(name);
        }
        self.notify();
    }

    /// All discovered clusters, sorted by name so merged snapshots are
    /// deterministic.
    pub fn list_clusters(&self) -> Vec<proto::Cluster> {
        let inner = self.inner.read().unwrap();
        let mut clusters: Vec<proto::Cluster> = inner.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        clusters
    }

    /// CRD routes in their stored order.
    pub fn list_routes(&self) -> Vec<proto::Route> {
        let inner = self.inner.read().unwrap();
        inner.routes.clone()
    }

    pub fn get_secret(&self, name: &str) -> Option<TlsSecret> {
        let inner = self.inner.read().unwrap();
        inner.secrets.get(name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
