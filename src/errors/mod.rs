//! # Error Handling
//!
//! Error types for both AGW processes, defined with `thiserror`. Every
//! recoverable failure in the configuration pipeline and on the data plane hot
//! path maps to a variant here; neither process treats any of them as fatal.

/// Custom result type for AGW operations
pub type Result<T> = std::result::Result<T, AgwError>;

/// Main error type shared by the control plane and the data plane
#[derive(thiserror::Error, Debug)]
pub enum AgwError {
    /// Configuration errors (env settings or the static YAML file)
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },

    /// Network transport errors (gRPC server/client, upstream HTTP)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Kubernetes API errors surfaced by the controllers
    #[error("Kubernetes error: {context}")]
    Kubernetes {
        #[source]
        source: kube::Error,
        context: String,
    },

    /// Snapshot pipeline errors
    #[error("xDS error: {message}")]
    Xds {
        message: String,
        node_id: Option<String>,
    },

    /// Wasm engine errors (compile failures, missing exports, traps)
    #[error("Wasm error: {message}")]
    Wasm { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl AgwError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create an xDS pipeline error
    pub fn xds<S: Into<String>>(message: S) -> Self {
        Self::Xds { message: message.into(), node_id: None }
    }

    /// Create an xDS pipeline error attributed to a node
    pub fn xds_with_node<S: Into<String>, N: Into<String>>(message: S, node_id: N) -> Self {
        Self::Xds { message: message.into(), node_id: Some(node_id.into()) }
    }

    /// Create a Wasm engine error
    pub fn wasm<S: Into<String>>(message: S) -> Self {
        Self::Wasm { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }
}

impl From<std::io::Error> for AgwError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_yaml::Error> for AgwError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Serialization {
            source: Box::new(error),
            context: "YAML deserialization failed".to_string(),
        }
    }
}

impl From<serde_json::Error> for AgwError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            source: Box::new(error),
            context: "JSON serialization failed".to_string(),
        }
    }
}

impl From<kube::Error> for AgwError {
    fn from(error: kube::Error) -> Self {
        Self::Kubernetes { source: error, context: "Kubernetes API request failed".to_string() }
    }
}

impl From<tonic::transport::Error> for AgwError {
    fn from(error: tonic::transport::Error) -> Self {
        Self::Transport(error.to_string())
    }
}
