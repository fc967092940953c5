//! VPN connection state
//!
//! # Transitions
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Connected ──▶ Reconnecting(1) ──▶ Reconnecting(n+1)
//!       ▲              │   │          │               │    │
//!       │              │   └─▶ Error ─┤               │    └──▶ Connected
//!       │              ▼        ▲ │   ▼               ▼
//!       └───────── Disconnecting ◀────┴────────── Disconnected (watchdog gave up)
//!
//! any ──▶ ForceDisconnected ──▶ Connecting | Disconnecting
//! ```

use crate::server::{VpnProtocol, VpnServer};
use std::fmt;

/// Session state
#[derive(Debug, Clone, PartialEq, Default)]
pub enum VpnConnectionState {
    #[default]
    Disconnected,
    Connecting {
        server: Option<VpnServer>,
    },
    Connected {
        server: VpnServer,
        protocol: VpnProtocol,
    },
    Disconnecting,
    Reconnecting {
        attempt: u32,
        server: Option<VpnServer>,
    },
    Error {
        message: String,
    },
    ForceDisconnected {
        reason: String,
    },
}

impl VpnConnectionState {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            VpnConnectionState::Disconnected => "disconnected",
            VpnConnectionState::Connecting { .. } => "connecting",
            VpnConnectionState::Connected { .. } => "connected",
            VpnConnectionState::Disconnecting => "disconnecting",
            VpnConnectionState::Reconnecting { .. } => "reconnecting",
            VpnConnectionState::Error { .. } => "error",
            VpnConnectionState::ForceDisconnected { .. } => "force-disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, VpnConnectionState::Connected { .. })
    }

    /// Server this state refers to, if any
    pub fn server(&self) -> Option<&VpnServer> {
        match self {
            VpnConnectionState::Connecting { server } | VpnConnectionState::Reconnecting { server, .. } => {
                server.as_ref()
            }
            VpnConnectionState::Connected { server, .. } => Some(server),
            _ => None,
        }
    }

    /// Check whether moving to `next` is a legal edge
    pub fn can_transition_to(&self, next: &VpnConnectionState) -> bool {
        use VpnConnectionState::*;

        match (self, next) {
            (_, ForceDisconnected { .. }) => true,

            (Disconnected, Connecting { .. }) => true,

            (Connecting { .. }, Connected { .. } | Error { .. } | Disconnecting) => true,

            (Error { .. }, Connecting { .. } | Disconnecting) => true,

            (Connected { .. }, Disconnecting) => true,
            (Connected { .. }, Reconnecting { attempt, .. }) => *attempt == 1,

            (Reconnecting { attempt: current, .. }, Reconnecting { attempt: following, .. }) => {
                current.checked_add(1) == Some(*following)
            }
            (Reconnecting { .. }, Connected { .. } | Disconnected | Disconnecting) => true,

            (Disconnecting, Disconnected | Error { .. }) => true,

            (ForceDisconnected { .. }, Connecting { .. } | Disconnecting) => true,

            _ => false,
        }
    }
}

impl fmt::Display for VpnConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnConnectionState::Disconnected => write!(f, "Disconnected"),
            VpnConnectionState::Connecting { server: Some(server) } => {
                write!(f, "Connecting to {}", server)
            }
            VpnConnectionState::Connecting { server: None } => write!(f, "Connecting"),
            VpnConnectionState::Connected { server, protocol } => {
                write!(f, "Connected to {} via {}", server, protocol)
            }
            VpnConnectionState::Disconnecting => write!(f, "Disconnecting"),
            VpnConnectionState::Reconnecting { attempt, .. } => {
                write!(f, "Reconnecting (attempt {})", attempt)
            }
            VpnConnectionState::Error { message } => write!(f, "Error: {}", message),
            VpnConnectionState::ForceDisconnected { reason } => {
                write!(f, "disconnected by server: {}", reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VpnConnectionState::*;

    fn server() -> VpnServer {
        VpnServer::new("de-1", "de1.halo.test")
    }

    fn connected() -> VpnConnectionState {
        Connected {
            server: server(),
            protocol: VpnProtocol::WireGuard,
        }
    }

    fn reconnecting(attempt: u32) -> VpnConnectionState {
        Reconnecting {
            attempt,
            server: Some(server()),
        }
    }

    fn error() -> VpnConnectionState {
        Error {
            message: "boom".into(),
        }
    }

    #[test]
    fn test_happy_path_edges() {
        let connecting = Connecting { server: Some(server()) };

        assert!(Disconnected.can_transition_to(&connecting));
        assert!(connecting.can_transition_to(&connected()));
        assert!(connected().can_transition_to(&Disconnecting));
        assert!(Disconnecting.can_transition_to(&Disconnected));
    }

    #[test]
    fn test_no_skipping_connecting() {
        assert!(!Disconnected.can_transition_to(&connected()));
        assert!(!Disconnected.can_transition_to(&Disconnecting));
        assert!(!connected().can_transition_to(&Connecting { server: None }));
    }

    #[test]
    fn test_reconnect_edges() {
        assert!(connected().can_transition_to(&reconnecting(1)));
        assert!(!connected().can_transition_to(&reconnecting(2)));
        assert!(reconnecting(1).can_transition_to(&reconnecting(2)));
        assert!(!reconnecting(1).can_transition_to(&reconnecting(3)));
        assert!(reconnecting(3).can_transition_to(&connected()));
        assert!(reconnecting(3).can_transition_to(&Disconnected));
    }

    #[test]
    fn test_error_and_forced_edges() {
        let forced = ForceDisconnected {
            reason: "banned".into(),
        };

        assert!(error().can_transition_to(&Connecting { server: None }));
        assert!(error().can_transition_to(&Disconnecting));
        assert!(!error().can_transition_to(&Disconnected));

        for state in [Disconnected, connected(), reconnecting(2), error(), Disconnecting] {
            assert!(state.can_transition_to(&forced));
        }
        assert!(forced.can_transition_to(&Connecting { server: None }));
        assert!(forced.can_transition_to(&Disconnecting));
        assert!(!forced.can_transition_to(&Disconnected));
    }

    #[test]
    fn test_display() {
        let forced = ForceDisconnected {
            reason: "account suspended".into(),
        };
        assert_eq!(forced.to_string(), "disconnected by server: account suspended");
        assert_eq!(reconnecting(2).to_string(), "Reconnecting (attempt 2)");
    }
}
