//! Diagnostic logging for the shell itself.
//!
//! Handlers report to the user through their own streams (see
//! [`crate::command::CommandContext`]); this subscriber is for operator-level
//! diagnostics emitted with the `tracing` macros and always goes to stderr.

use crate::config::LOG_ENV;
use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `FLUX_LOG` wins over `default_filter`; an unparsable filter falls back to `warn`.
pub fn init(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))
}
