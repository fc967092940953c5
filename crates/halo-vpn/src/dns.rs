//! Tunnel DNS selection
//!
//! Decides which resolvers the tunnel hands to the OS:
//! - `System`: leave the platform's resolvers alone (empty list)
//! - `Public`: a well-known privacy resolver, addresses taken from the
//!   hickory presets
//! - `Custom`: user-supplied addresses

use crate::error::VpnError;
use hickory_resolver::config::ResolverConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Public resolver presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicResolver {
    Cloudflare,
    Google,
    Quad9,
}

impl PublicResolver {
    fn resolver_config(&self) -> ResolverConfig {
        match self {
            PublicResolver::Cloudflare => ResolverConfig::cloudflare(),
            PublicResolver::Google => ResolverConfig::google(),
            PublicResolver::Quad9 => ResolverConfig::quad9(),
        }
    }

    /// Resolver addresses, deduplicated, in preset order
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        for server in self.resolver_config().name_servers() {
            let ip = server.socket_addr.ip();
            if !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }
        addresses
    }
}

/// DNS preference
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum DnsSetting {
    #[default]
    System,
    Public(PublicResolver),
    Custom(Vec<IpAddr>),
}

impl DnsSetting {
    /// Resolver addresses for the tunnel; empty means "use system DNS"
    pub fn resolve(&self) -> Result<Vec<IpAddr>, VpnError> {
        match self {
            DnsSetting::System => Ok(Vec::new()),
            DnsSetting::Public(resolver) => Ok(resolver.addresses()),
            DnsSetting::Custom(addresses) => {
                if addresses.is_empty() {
                    return Err(VpnError::Dns("custom DNS has no servers".to_string()));
                }
                if let Some(bad) = addresses
                    .iter()
                    .find(|ip| ip.is_unspecified() || ip.is_multicast())
                {
                    return Err(VpnError::Dns(format!("{} is not a usable resolver", bad)));
                }
                Ok(addresses.clone())
            }
        }
    }
}
