//! VPN Configuration
//!
//! User-facing VPN settings and the per-connection tunnel configuration
//! derived from them.

use crate::dns::DnsSetting;
use crate::error::VpnError;
use crate::server::{VpnProtocol, VpnServer};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// How the tunnel protocol is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "protocol")]
pub enum ProtocolPreference {
    /// Use whatever the server advertises
    #[default]
    Auto,
    /// Always use this protocol
    Manual(VpnProtocol),
}

impl ProtocolPreference {
    /// Protocol to use for `server`
    pub fn resolve(&self, server: &VpnServer) -> VpnProtocol {
        match self {
            ProtocolPreference::Auto => server.protocol,
            ProtocolPreference::Manual(protocol) => *protocol,
        }
    }
}

/// User VPN settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnSettings {
    /// Block traffic while the tunnel is down
    #[serde(default = "default_true")]
    pub kill_switch: bool,
    /// Connect automatically on launch when signed in
    #[serde(default)]
    pub auto_connect_on_launch: bool,
    #[serde(default)]
    pub protocol_preference: ProtocolPreference,
    #[serde(default)]
    pub dns: DnsSetting,
}

fn default_true() -> bool {
    true
}

impl Default for VpnSettings {
    fn default() -> Self {
        Self {
            kill_switch: true,
            auto_connect_on_launch: false,
            protocol_preference: ProtocolPreference::Auto,
            dns: DnsSetting::System,
        }
    }
}

impl VpnSettings {
    /// Validate settings
    pub fn validate(&self) -> Result<(), VpnError> {
        self.dns.resolve().map(|_| ())
    }

    /// Tunnel configuration for connecting to `server`
    pub fn tunnel_config(&self, server: &VpnServer) -> Result<TunnelConfig, VpnError> {
        Ok(TunnelConfig {
            server: server.clone(),
            protocol: self.protocol_preference.resolve(server),
            dns_servers: self.dns.resolve()?,
            kill_switch: self.kill_switch,
        })
    }
}

/// Everything the engine needs to bring one tunnel up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub server: VpnServer,
    pub protocol: VpnProtocol,
    /// Empty means "keep system DNS"
    pub dns_servers: Vec<IpAddr>,
    pub kill_switch: bool,
}
