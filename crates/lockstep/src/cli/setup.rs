//! Logging initialization for the binary

use anyhow::Result;

/// Initialize tracing subscriber for logging
///
/// Honors `RUST_LOG`, defaults to INFO, and writes to stderr so reports on
/// stdout stay machine-readable.
///
/// # Errors
/// Returns an error if a global subscriber is already installed
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))
}
