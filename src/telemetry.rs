//! Logging setup for the binary.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_FILTER: &str = "echo_orchestrator=info,tower_http=info";

/// Install a global fmt subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_telemetry(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
