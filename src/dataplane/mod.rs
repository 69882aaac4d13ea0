//! # Data plane
//!
//! Everything on the request path: the snapshot consumer, the hot-swappable
//! active snapshot, listener lifecycle, routing, the gateway HTTP service and
//! the shared external resource pools.

mod client;
mod listeners;
mod proxy;
pub mod resources;
mod router;
mod snapshot;

pub use client::SnapshotConsumer;
pub use listeners::ListenerManager;
pub use proxy::GatewayService;
pub use router::{match_route, pick_endpoint, RouteError};
pub use snapshot::{new_handle, sanitize, ActiveHandle, ActiveSnapshot};
