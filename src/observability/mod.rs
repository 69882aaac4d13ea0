//! # Observability
//!
//! Structured logging setup shared by both binaries, built on the tracing
//! ecosystem. Verbosity is selected through `RUST_LOG`.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Initialize structured logging once per process.
///
/// Reads the filter from `RUST_LOG`, falling back to `agw=info,tonic=info`.
/// Subsequent calls are no-ops so tests can call this freely.
pub fn init_logging() {
    LOGGING_INITIALIZED.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| "agw=info,tonic=info".into()),
            )
            .with_target(true)
            .init();
    });
}
