//! Server and protocol model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
    WireGuard,
    OpenVpn,
    Ikev2,
}

impl VpnProtocol {
    /// Stable identifier used for persistence and the API
    pub fn as_str(&self) -> &'static str {
        match self {
            VpnProtocol::WireGuard => "wireguard",
            VpnProtocol::OpenVpn => "openvpn",
            VpnProtocol::Ikev2 => "ikev2",
        }
    }
}

impl fmt::Display for VpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VpnProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wireguard" => Ok(VpnProtocol::WireGuard),
            "openvpn" => Ok(VpnProtocol::OpenVpn),
            "ikev2" => Ok(VpnProtocol::Ikev2),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// A VPN exit server as advertised by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnServer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub country: String,
    pub hostname: String,
    /// Protocol the server prefers
    #[serde(default = "default_protocol")]
    pub protocol: VpnProtocol,
    #[serde(default = "default_available")]
    pub is_available: bool,
    #[serde(default)]
    pub is_recommended: bool,
    /// Load percentage, when reported
    #[serde(default)]
    pub load: Option<u8>,
}

fn default_protocol() -> VpnProtocol {
    VpnProtocol::WireGuard
}

fn default_available() -> bool {
    true
}

impl VpnServer {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            country: String::new(),
            hostname: hostname.into(),
            protocol: default_protocol(),
            is_available: true,
            is_recommended: false,
            load: None,
        }
    }
}

impl fmt::Display for VpnServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        assert_eq!("WireGuard".parse::<VpnProtocol>().unwrap(), VpnProtocol::WireGuard);
        assert_eq!(VpnProtocol::Ikev2.to_string(), "ikev2");
        assert!("pptp".parse::<VpnProtocol>().is_err());
        assert_eq!(serde_json::to_string(&VpnProtocol::OpenVpn).unwrap(), r#""openvpn""#);
    }

    #[test]
    fn test_server_defaults_from_api() {
        let server: VpnServer = serde_json::from_str(
            r#"{"id":"de-1","name":"Frankfurt","hostname":"de1.halo.test"}"#,
        )
        .unwrap();
        assert_eq!(server.protocol, VpnProtocol::WireGuard);
        assert!(server.is_available);
        assert!(!server.is_recommended);
    }
}
