//! Tracing setup for host applications

use anyhow::{anyhow, Result};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,halo_network=info,halo_realtime=info,halo_vpn=info";

/// Install a compact fmt subscriber
///
/// `RUST_LOG` wins over `filter`. Fails if a global subscriber is already set.
pub fn init_logging(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(filter))?;

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
