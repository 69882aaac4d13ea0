//! # Configuration
//!
//! Environment-driven process settings plus the static YAML pipeline: the
//! loader turns the operator-authored file into an initial
//! [`ConfigSnapshot`](crate::proto::ConfigSnapshot) and the watcher re-loads it
//! on change.

mod loader;
mod settings;
mod watcher;

pub use loader::{empty_snapshot, generate_version, load_config, to_snapshot, StaticConfig};
pub use settings::{ControlPlaneConfig, DataPlaneConfig};
pub use watcher::ConfigWatcher;
