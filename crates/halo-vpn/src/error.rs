//! VPN errors

use halo_network::ApiError;
use thiserror::Error;

/// Tunnel engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Tunnel connect failed: {0}")]
    ConnectFailed(String),

    #[error("Tunnel disconnect failed: {0}")]
    DisconnectFailed(String),

    #[error("VPN permission denied")]
    PermissionDenied,
}

/// VPN session errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VpnError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("DNS configuration error: {0}")]
    Dns(String),

    #[error("No server available")]
    NoServer,

    #[error("Connect cancelled by disconnect")]
    Cancelled,

    #[error(transparent)]
    Api(#[from] ApiError),
}
