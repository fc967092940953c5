//! Client configuration
//!
//! Loaded from TOML or JSON. Everything except `api.base_url` has a
//! default; durations are written in milliseconds.
//!
//! ```toml
//! [api]
//! base_url = "https://api.halo.example/v1"
//! timeout_ms = 15000
//!
//! [retry]
//! max_retries = 2
//!
//! [vpn]
//! kill_switch = true
//! auto_connect_on_launch = true
//! dns = { mode = "public", value = "cloudflare" }
//! ```

use halo_network::{AuthConfig, HttpTransportConfig, RetryPolicy, Url};
use halo_realtime::{millis, BackoffConfig, RealtimeConfig};
use halo_vpn::{VpnSettings, WatchdogConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unsupported config format (use .toml or .json)")]
    UnsupportedFormat,
}

/// Backend connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    pub base_url: Url,
    #[serde(default = "default_timeout", with = "millis", rename = "timeout_ms")]
    pub timeout: Duration,
    #[serde(
        default = "default_connect_timeout",
        with = "millis",
        rename = "connect_timeout_ms"
    )]
    pub connect_timeout: Duration,
    /// Overrides the built-in User-Agent
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Backend endpoint paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub refresh: String,
    pub ticket: String,
    pub servers: String,
    pub recommended_server: String,
    pub devices: String,
    pub socket: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            refresh: "/auth/refresh".to_string(),
            ticket: "/realtime/ticket".to_string(),
            servers: "/vpn/servers".to_string(),
            recommended_server: "/vpn/servers/recommended".to_string(),
            devices: "/vpn/devices".to_string(),
            socket: "/ws".to_string(),
        }
    }
}

/// Retry layer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    #[serde(with = "millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    pub retry_mutating: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay: policy.initial_delay,
            retry_mutating: policy.retry_mutating,
        }
    }
}

/// Auth layer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Delays between refresh attempts
    pub refresh_backoff_ms: Vec<u64>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            refresh_backoff_ms: AuthConfig::default()
                .refresh_backoff
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect(),
        }
    }
}

/// Auto-reconnect watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        let config = WatchdogConfig::default();
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff,
        }
    }
}

/// Whole client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api: ApiSettings,
    #[serde(default)]
    pub endpoints: EndpointPaths,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub auth: AuthSettings,
    /// Push channel reconnect backoff
    #[serde(default)]
    pub realtime: BackoffConfig,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub vpn: VpnSettings,
}

impl ClientConfig {
    /// Defaults around `base_url`
    pub fn new(base_url: Url) -> Self {
        Self {
            api: ApiSettings {
                base_url,
                timeout: default_timeout(),
                connect_timeout: default_connect_timeout(),
                user_agent: None,
            },
            endpoints: EndpointPaths::default(),
            retry: RetrySettings::default(),
            auth: AuthSettings::default(),
            realtime: BackoffConfig::default(),
            watchdog: WatchdogSettings::default(),
            vpn: VpnSettings::default(),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        match extension.as_deref() {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.api.base_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "api.base_url must be http or https, got {}",
                self.api.base_url.scheme()
            )));
        }
        if self.api.timeout.is_zero() || self.api.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("api timeouts must be non-zero".into()));
        }

        let endpoints = &self.endpoints;
        for (name, path) in [
            ("refresh", &endpoints.refresh),
            ("ticket", &endpoints.ticket),
            ("servers", &endpoints.servers),
            ("recommended_server", &endpoints.recommended_server),
            ("devices", &endpoints.devices),
            ("socket", &endpoints.socket),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "endpoints.{} must start with '/'",
                    name
                )));
            }
        }

        for (name, backoff) in [("realtime", &self.realtime), ("watchdog", &self.watchdog.backoff)] {
            if backoff.multiplier < 1.0 || !(0.0..=1.0).contains(&backoff.jitter_ratio) {
                return Err(ConfigError::Invalid(format!(
                    "{} backoff needs multiplier >= 1 and jitter_ratio in [0, 1]",
                    name
                )));
            }
            if backoff.initial_delay > backoff.max_delay {
                return Err(ConfigError::Invalid(format!(
                    "{} backoff initial delay exceeds max delay",
                    name
                )));
            }
        }
        if self.watchdog.max_attempts == 0 {
            return Err(ConfigError::Invalid("watchdog.max_attempts must be at least 1".into()));
        }

        self.vpn
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("vpn: {}", e)))
    }

    pub fn http_transport(&self) -> HttpTransportConfig {
        let mut config = HttpTransportConfig::new(self.api.base_url.clone());
        config.timeout = self.api.timeout;
        config.connect_timeout = self.api.connect_timeout;
        if let Some(agent) = &self.api.user_agent {
            config.user_agent = agent.clone();
        }
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: self.retry.initial_delay,
            retry_mutating: self.retry.retry_mutating,
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            refresh_path: self.endpoints.refresh.clone(),
            refresh_backoff: self
                .auth
                .refresh_backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            base_url: self.api.base_url.clone(),
            socket_path: self.endpoints.socket.clone(),
            backoff: self.realtime.clone(),
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            max_attempts: self.watchdog.max_attempts,
            backoff: self.watchdog.backoff.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_vpn::{DnsSetting, PublicResolver};
    use std::io::Write;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = ClientConfig::from_toml(
            r#"
            [api]
            base_url = "https://api.halo.test/v1"
            "#,
        )
        .unwrap();

        assert_eq!(config, ClientConfig::new(Url::parse("https://api.halo.test/v1").unwrap()));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.watchdog_config(), WatchdogConfig::default());
        assert!(config.vpn.kill_switch);
    }

    #[test]
    fn test_full_toml() {
        let config = ClientConfig::from_toml(
            r#"
            [api]
            base_url = "https://api.halo.test"
            timeout_ms = 15000
            user_agent = "halo-ios/3.1"

            [endpoints]
            ticket = "/ws/ticket"

            [retry]
            max_retries = 1
            initial_delay_ms = 250

            [auth]
            refresh_backoff_ms = [100]

            [realtime]
            max_delay = 60000
            jitter_ratio = 0.25

            [vpn]
            auto_connect_on_launch = true
            dns = { mode = "public", value = "cloudflare" }
            "#,
        )
        .unwrap();

        let transport = config.http_transport();
        assert_eq!(transport.timeout, Duration::from_secs(15));
        assert_eq!(transport.user_agent, "halo-ios/3.1");
        assert_eq!(config.endpoints.ticket, "/ws/ticket");
        assert_eq!(config.endpoints.servers, "/vpn/servers");
        assert_eq!(config.retry_policy().initial_delay, Duration::from_millis(250));
        assert_eq!(config.auth_config().refresh_backoff, vec![Duration::from_millis(100)]);

        let realtime = config.realtime_config();
        assert_eq!(realtime.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(realtime.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(config.vpn.dns, DnsSetting::Public(PublicResolver::Cloudflare));
    }

    #[test]
    fn test_json() {
        let config = ClientConfig::from_json(
            r#"{
                "api": { "base_url": "http://localhost:8080" },
                "watchdog": { "max_attempts": 8 },
                "vpn": { "kill_switch": false }
            }"#,
        )
        .unwrap();

        assert_eq!(config.watchdog_config().max_attempts, 8);
        assert!(!config.vpn.kill_switch);
    }

    #[test]
    fn test_validation() {
        let base = ClientConfig::new(Url::parse("https://api.halo.test").unwrap());
        assert!(base.validate().is_ok());

        let mut config = base.clone();
        config.api.base_url = Url::parse("ftp://api.halo.test").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = base.clone();
        config.endpoints.devices = "devices".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = base.clone();
        config.realtime.jitter_ratio = 2.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = base.clone();
        config.vpn.dns = DnsSetting::Custom(vec![]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        assert!(matches!(
            ClientConfig::from_toml("[api]\nbase_url = \"not a url\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("client.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[api]\nbase_url = \"https://api.halo.test\"").unwrap();
        assert!(ClientConfig::from_file(&path).is_ok());

        let path = dir.path().join("client.yaml");
        std::fs::write(&path, "api: {}").unwrap();
        assert!(matches!(
            ClientConfig::from_file(&path),
            Err(ConfigError::UnsupportedFormat)
        ));

        assert!(matches!(
            ClientConfig::from_file(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
