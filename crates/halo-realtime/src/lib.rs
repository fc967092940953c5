//! Halo Realtime
//!
//! Ticket-authenticated push-event socket with backoff reconnection.

mod backoff;
mod channel;
mod error;
mod event;
mod socket;
mod ticket;

pub use backoff::{millis, BackoffConfig, ReconnectBackoff};
pub use channel::{RealtimeChannel, RealtimeConfig, WebSocketConnectionState};
pub use error::RealtimeError;
pub use event::{FrameError, Notification, ServerStatus, SubscriptionUpdate, WebSocketEvent};
pub use socket::{Socket, SocketConnector, TungsteniteConnector};
pub use ticket::{ApiTicketProvider, TicketProvider};
