//! Structured logging setup shared by all of our binaries.

use tracing_subscriber::EnvFilter;

use crate::Result;

/// Initialize `tracing` for a command-line tool or daemon. Honors
/// `RUST_LOG` the usual way, defaulting to `info` if it isn't set.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    Ok(())
}
