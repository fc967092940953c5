//! API error taxonomy
//!
//! Every layer of the request pipeline speaks `ApiError`. The type is
//! `Clone` because a single outcome may fan out to many waiters (dedup
//! followers, queued 401 callers), and each must observe the same variant
//! and message as the original call.

use thiserror::Error;

/// Credential store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the request pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Refresh token invalid")]
    RefreshTokenInvalid,

    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// The refresh call kept failing transiently; tokens are untouched
    #[error("Token refresh unavailable: {0}")]
    RefreshUnavailable(Box<ApiError>),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this is a 401 response
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Transient failures the generic retry layer may repeat:
    /// connection errors, timeouts and any 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Connection(_) | ApiError::Timeout => true,
            ApiError::Status { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// Transient failures of the refresh call: connection errors,
    /// timeouts and gateway-class statuses only.
    pub fn is_refresh_transient(&self) -> bool {
        match self {
            ApiError::Connection(_) | ApiError::Timeout => true,
            ApiError::Status { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }

    /// 401/403 on the refresh call: the refresh token is dead
    pub fn is_permanent_auth(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    /// Check if the caller cancelled the request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }

    /// Check if the session is gone and the user must log in again
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired(_) | ApiError::RefreshTokenInvalid)
    }
}
