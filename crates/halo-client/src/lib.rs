//! Halo Client
//!
//! Host-facing entry point: configuration, logging, and the service
//! container that wires the resilient API client, the realtime channel
//! and the VPN session together.
//!
//! ```rust,ignore
//! halo_client::init_logging(halo_client::DEFAULT_LOG_FILTER)?;
//! let config = ClientConfig::from_file(Path::new("halo.toml"))?;
//! let services = ClientServices::build(&config, platform)?;
//! services.start().await;
//! ```

mod config;
mod logging;
mod services;

pub use config::{
    ApiSettings, AuthSettings, ClientConfig, ConfigError, EndpointPaths, RetrySettings,
    WatchdogSettings,
};
pub use logging::{init_logging, DEFAULT_LOG_FILTER};
pub use services::{ClientServices, Platform};
