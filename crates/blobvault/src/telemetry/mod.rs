//! Structured logging for the `blobvault` binary.
//!
//! JSON lines on stderr, so `cat` can stream plaintext on stdout.
//!
//! # Telemetry invariants
//!
//! - **No plaintext or key material** in any log field. Names, key ids,
//!   formats and lengths only.
//! - Log level comes from `RUST_LOG` if set, otherwise `BLOBVAULT_LOG_LEVEL`.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if the subscriber has already been set.
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))
}
