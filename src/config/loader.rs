//! # Static Config Loader
//!
//! Parses the operator-authored YAML file into an initial
//! [`ConfigSnapshot`]. The snapshot's `version_id` is a content hash so an
//! unchanged file always produces the same version.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::Result;
use crate::proto;

/// Root of the YAML configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resources: Option<ResourcesConfig>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub redis: Vec<RedisResource>,
    #[serde(default)]
    pub databases: Vec<DatabaseResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisResource {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseResource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub connection_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    pub address: String,
    pub port: u32,
    #[serde(default)]
    pub tls: Option<TlsRef>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsRef {
    pub secret_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path prefix, e.g. `/api`.
    #[serde(rename = "match")]
    pub path_prefix: String,
    #[serde(default)]
    pub domain: String,
    /// Cluster reference, resolved within the same snapshot.
    pub cluster: String,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    pub wasm_path: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    pub port: u32,
}

/// Read and parse the file at `path` into a snapshot.
pub fn load_config(path: &Path) -> Result<proto::ConfigSnapshot> {
    let data = std::fs::read(path)?;
    let dsl: StaticConfig = serde_yaml::from_slice(&data)?;
    Ok(to_snapshot(&dsl, &data))
}

/// Convert the parsed DSL into the wire snapshot. Routes are flattened from
/// listeners in declaration order; that order is the static match precedence.
pub fn to_snapshot(dsl: &StaticConfig, raw: &[u8]) -> proto::ConfigSnapshot {
    let mut snapshot = proto::ConfigSnapshot {
        version_id: generate_version(raw),
        ..Default::default()
    };

    if let Some(resources) = &dsl.resources {
        let mut external = proto::ExternalResources::default();
        for r in &resources.redis {
            external.redis.push(proto::RedisConfig {
                name: r.name.clone(),
                address: r.address.clone(),
            });
        }
        for db in &resources.databases {
            external.databases.push(proto::DatabaseConfig {
                name: db.name.clone(),
                r#type: db.kind.clone(),
                connection_string: db.connection_string.clone(),
            });
        }
        snapshot.resources = Some(external);
    }

    for l in &dsl.listeners {
        snapshot.listeners.push(proto::Listener {
            name: l.name.clone(),
            address: l.address.clone(),
            port: l.port,
            tls: l.tls.as_ref().map(|t| proto::TlsConfig {
                secret_name: t.secret_name.clone(),
                ..Default::default()
            }),
        });

        for r in &l.routes {
            snapshot.routes.push(proto::Route {
                path_prefix: r.path_prefix.clone(),
                domain: r.domain.clone(),
                cluster_id: r.cluster.clone(),
                plugins: r
                    .plugins
                    .iter()
                    .map(|p| proto::Plugin {
                        name: p.name.clone(),
                        wasm_path: p.wasm_path.clone(),
                        config: p.config.clone(),
                    })
                    .collect(),
            });
        }
    }

    for c in &dsl.clusters {
        snapshot.clusters.push(proto::Cluster {
            name: c.name.clone(),
            endpoints: c
                .endpoints
                .iter()
                .map(|e| proto::Endpoint { address: e.address.clone(), port: e.port })
                .collect(),
        });
    }

    snapshot
}

/// Content-hash version: first 8 hex chars of SHA-256 over the raw file bytes.
pub fn generate_version(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..8].to_string()
}

/// The snapshot a control plane serves before any file has been loaded.
pub fn empty_snapshot() -> proto::ConfigSnapshot {
    proto::ConfigSnapshot { version_id: "init".to_string(), ..Default::default() }
}
