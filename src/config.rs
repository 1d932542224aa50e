//! Session configuration.
//!
//! [`ShellConfig::default`] holds the built-in values; the binary overrides
//! them from its command-line options.

use crate::command::Level;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted for the diagnostic log filter.
pub const LOG_ENV: &str = "FLUX_LOG";

/// How long [`crate::jobs::JobRegistry::add`] waits after starting a job.
pub const DEFAULT_JOB_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// `tracing` filter directive used when `FLUX_LOG` is unset.
    pub log_filter: String,
    /// Directory crash reports are written to.
    pub crash_dir: PathBuf,
    /// Grace delay after a background job is started.
    pub job_grace: Duration,
    /// Threshold for handler messages (`info`, `debug`, ...).
    pub verbosity: Level,
    /// Whether the interactive loop keeps an in-memory history.
    pub history: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            log_filter: "warn".to_string(),
            crash_dir: std::env::temp_dir().join("flux-crash"),
            job_grace: DEFAULT_JOB_GRACE,
            verbosity: Level::NotSet,
            history: true,
        }
    }
}
