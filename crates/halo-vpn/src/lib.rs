//! Halo VPN - Connection Lifecycle
//!
//! Owns the VPN session: which server the user is on, whether the tunnel
//! is up, and what happens when it drops. The packet-level tunnel lives in
//! a platform engine behind [`TunnelEngine`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    VpnSessionManager                       │
//! │                                                            │
//! │  connect/disconnect ──▶ state machine ──▶ watch / changes  │
//! │          │                    ▲                            │
//! │          ▼                    │                            │
//! │  ┌──────────────┐   ┌─────────┴──────────┐  ┌───────────┐  │
//! │  │ TunnelEngine │──▶│ AutoReconnect-     │  │ KillSwitch│  │
//! │  │  (platform)  │   │ Watchdog           │  └───────────┘  │
//! │  └──────────────┘   └────────────────────┘                 │
//! │          ▲                    ▲                            │
//! └──────────│────────────────────│────────────────────────────┘
//!            │                    │
//!     NetworkObserver      RealtimeChannel (ForceDisconnect)
//! ```
//!
//! # Features
//!
//! - **Validated transitions**: illegal state edges are refused
//! - **Kill Switch**: traffic blocked while a protected tunnel is down
//! - **Auto-reconnect**: engine re-established with backoff
//! - **Launch recovery**: a tunnel that outlived the app is adopted

mod config;
mod dns;
mod engine;
mod error;
mod kill_switch;
mod persistence;
mod server;
mod session;
mod state;
mod watchdog;

#[cfg(test)]
mod testing;

pub use config::{ProtocolPreference, TunnelConfig, VpnSettings};
pub use dns::{DnsSetting, PublicResolver};
pub use engine::{
    ApiDeviceRegistrar, ApiServerDirectory, DeviceRegistrar, EngineStatus, EngineUpdate,
    NetworkObserver, ServerDirectory, TunnelEngine,
};
pub use error::{EngineError, VpnError};
pub use kill_switch::{KillSwitch, KillSwitchState};
pub use persistence::{ConnectionRecord, ConnectionStore};
pub use server::{VpnProtocol, VpnServer};
pub use session::{LaunchOutcome, SessionServices, Subscription, VpnSessionManager};
pub use state::VpnConnectionState;
pub use watchdog::{AutoReconnectWatchdog, WatchdogConfig, WatchdogEvent};
