//! # AGW
//!
//! AGW is a cloud-native L7 HTTP gateway split into two cooperating processes:
//!
//! - a **control plane** that merges a static YAML file with Kubernetes-discovered
//!   state (Services, EndpointSlices, TLS Secrets and `GatewayRoute` custom
//!   resources) into versioned [`proto::ConfigSnapshot`]s and broadcasts them over
//!   a long-lived gRPC server stream, and
//! - a **data plane** that terminates HTTP(S), routes requests to upstream
//!   clusters, and executes per-route WebAssembly plugins with async host
//!   functions for logging, Redis and SQL.
//!
//! ## Architecture
//!
//! ```text
//! config.yaml ─┐
//!              ├─► Registry ─► xDS merge ─► snapshot stream ─► active snapshot
//! Kubernetes ──┘                                                    │
//!                                      listeners ◄── routing ◄──────┤
//!                                      Wasm plugin chain ◄──────────┘
//! ```
//!
//! The binaries live in `src/bin/`: `agw-controlplane` and `agw-dataplane`.

pub mod config;
pub mod dataplane;
pub mod errors;
pub mod k8s;
pub mod observability;
pub mod registry;
pub mod wasm;
pub mod xds;

/// Generated `agw.v1` wire types and service stubs.
pub mod proto {
    tonic::include_proto!("agw.v1");
}

pub use errors::{AgwError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "agw");
    }
}
