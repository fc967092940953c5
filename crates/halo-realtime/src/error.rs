//! Realtime channel errors

use thiserror::Error;

/// Realtime errors
///
/// `Clone` so one connect outcome can be shared by every caller awaiting
/// the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("Ticket request failed: {0}")]
    Ticket(String),

    #[error("WebSocket connect failed: {0}")]
    Connect(String),

    #[error("WebSocket stream error: {0}")]
    Stream(String),

    #[error("Invalid socket URL: {0}")]
    InvalidUrl(String),

    #[error("Connect timeout")]
    Timeout,

    #[error("Connect cancelled")]
    Cancelled,
}
