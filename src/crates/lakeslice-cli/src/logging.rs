//! Tracing subscriber setup

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Environment variable consulted when `--log-level` is not given.
pub const LOG_ENV: &str = "LAKESLICE_LOG";

/// Pick the filter directive: flag, then environment, then config.
pub fn filter_directive(flag: Option<&str>, env: Option<String>, config: &str) -> String {
    flag.map(str::to_string)
        .or_else(|| env.filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| config.to_string())
}

/// Install the global fmt subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init(flag: Option<&str>, config_level: &str) -> Result<()> {
    let directive = filter_directive(flag, std::env::var(LOG_ENV).ok(), config_level);
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}
