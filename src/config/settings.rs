//! # Process Settings
//!
//! Environment-variable configuration for both binaries, with the defaults the
//! deployment manifests rely on.

use std::path::PathBuf;

use crate::errors::{AgwError, Result};

/// Control plane settings.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// gRPC listen port (`PORT`, default 18000).
    pub port: u16,
    /// Static YAML config path (`AGW_CONFIG_PATH`, default `config.yaml`).
    pub config_path: PathBuf,
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|e| AgwError::config(format!("Invalid PORT '{}': {}", raw, e)))?,
            Err(_) => 18000,
        };

        let config_path = std::env::var("AGW_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.yaml"));

        Ok(Self { port, config_path })
    }

    /// Socket address string the gRPC server binds to.
    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

/// Data plane settings.
#[derive(Debug, Clone)]
pub struct DataPlaneConfig {
    /// Control plane URL (`AGW_CONTROL_PLANE_URL`, default `http://localhost:18000`).
    pub control_plane_url: String,
    /// Node identity sent at subscription (`AGW_NODE_ID`).
    pub node_id: String,
    /// Optional region label (`AGW_NODE_REGION`).
    pub region: String,
}

impl DataPlaneConfig {
    pub fn from_env() -> Self {
        let control_plane_url = std::env::var("AGW_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://localhost:18000".to_string());

        let node_id = std::env::var("AGW_NODE_ID")
            .unwrap_or_else(|_| format!("agw-dp-{}", std::process::id()));

        let region = std::env::var("AGW_NODE_REGION").unwrap_or_default();

        Self { control_plane_url, node_id, region }
    }
}
