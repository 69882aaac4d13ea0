//! Active-snapshot publication.
//!
//! The data plane keeps exactly one active snapshot behind an atomically
//! swappable shared reference. Request handlers load a strong reference at
//! the top of the request and hold it until the response completes, so an
//! in-flight request observes one snapshot end-to-end and old snapshots stay
//! alive until their last request drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::warn;

use crate::proto;

/// A published snapshot plus the per-cluster round-robin cursors that live
/// with it.
pub struct ActiveSnapshot {
    pub snapshot: proto::ConfigSnapshot,
    cursors: HashMap<String, AtomicUsize>,
}

impl ActiveSnapshot {
    pub fn new(snapshot: proto::ConfigSnapshot) -> Self {
        let cursors = snapshot
            .clusters
            .iter()
            .map(|c| (c.name.clone(), AtomicUsize::new(0)))
            .collect();
        Self { snapshot, cursors }
    }

    /// Round-robin index for the named cluster.
    pub(crate) fn next_index(&self, cluster: &str, len: usize) -> usize {
        match self.cursors.get(cluster) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed) % len,
            None => 0,
        }
    }
}

/// The hot-path handle: single writer (the snapshot consumer), many readers.
pub type ActiveHandle = Arc<ArcSwapOption<ActiveSnapshot>>;

pub fn new_handle() -> ActiveHandle {
    Arc::new(ArcSwapOption::const_empty())
}

/// Structural validation applied before publication: every route must resolve
/// its cluster inside the same snapshot, otherwise it is dropped with a
/// warning.
pub fn sanitize(mut snapshot: proto::ConfigSnapshot) -> proto::ConfigSnapshot {
    let cluster_names: std::collections::HashSet<&str> =
        snapshot.clusters.iter().map(|c| c.name.as_str()).collect();

    let mut kept = Vec::with_capacity(snapshot.routes.len());
    for route in snapshot.routes {
        if cluster_names.contains(route.cluster_id.as_str()) {
            kept.push(route);
        } else {
            warn!(
                path_prefix = %route.path_prefix,
                cluster_id = %route.cluster_id,
                "Dropping route with unresolved cluster"
            );
        }
    }
    snapshot.routes = kept;
    snapshot
}
