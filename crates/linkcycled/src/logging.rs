//! Console logging setup.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Legacy variable honoured when `RUST_LOG` is not set
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

const DEFAULT_LEVEL: &str = "info";

/// Pick the filter directive: explicit flag, then `RUST_LOG`, then
/// `LOG_LEVEL`, then `info`.
pub fn filter_directive(
    flag: Option<&str>,
    rust_log: Option<String>,
    log_level: Option<String>,
) -> String {
    let non_empty = |d: String| {
        let d = d.trim().to_string();
        (!d.is_empty()).then_some(d)
    };
    flag.map(str::to_string)
        .and_then(non_empty)
        .or_else(|| rust_log.and_then(non_empty))
        .or_else(|| log_level.map(|l| l.to_lowercase()).and_then(non_empty))
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string())
}

/// Install the global fmt subscriber
pub fn init(flag: Option<&str>) -> Result<()> {
    let directive = filter_directive(
        flag,
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        std::env::var(ENV_LOG_LEVEL).ok(),
    );
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow!("Invalid log filter {:?}: {}", directive, e))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {}", e))
}
