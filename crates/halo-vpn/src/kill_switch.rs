//! Kill Switch
//!
//! Blocks traffic outside the tunnel while a protected session is being
//! established or has dropped.
//!
//! # Behavior
//!
//! The session engages the switch before asking the engine for a tunnel
//! (when the user enabled it) and releases it on explicit disconnect or a
//! failed connect. While engaged:
//! - tunnel up: traffic allowed (`Armed`)
//! - tunnel down: traffic blocked (`Blocking`)
//!
//! The platform layer enforces the block; it follows `watch()`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Kill switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    /// Not engaged
    Disabled,
    /// Engaged and the tunnel is up (traffic allowed)
    Armed,
    /// Engaged and the tunnel is down (traffic blocked)
    Blocking,
}

impl KillSwitchState {
    pub fn allows_traffic(&self) -> bool {
        matches!(self, KillSwitchState::Disabled | KillSwitchState::Armed)
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, KillSwitchState::Blocking)
    }
}

struct Inner {
    engaged: AtomicBool,
    tunnel_up: AtomicBool,
    state: watch::Sender<KillSwitchState>,
}

/// Shared kill switch handle
///
/// ```rust,ignore
/// let kill_switch = KillSwitch::new();
/// kill_switch.engage();          // Blocking until the tunnel is up
/// kill_switch.on_tunnel_up();    // Armed
/// kill_switch.release();         // Disabled
/// ```
#[derive(Clone)]
pub struct KillSwitch {
    inner: Arc<Inner>,
}

impl KillSwitch {
    pub fn new() -> Self {
        let (state, _) = watch::channel(KillSwitchState::Disabled);
        Self {
            inner: Arc::new(Inner {
                engaged: AtomicBool::new(false),
                tunnel_up: AtomicBool::new(false),
                state,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> KillSwitchState {
        if !self.inner.engaged.load(Ordering::SeqCst) {
            KillSwitchState::Disabled
        } else if self.inner.tunnel_up.load(Ordering::SeqCst) {
            KillSwitchState::Armed
        } else {
            KillSwitchState::Blocking
        }
    }

    /// Follow state changes
    pub fn watch(&self) -> watch::Receiver<KillSwitchState> {
        self.inner.state.subscribe()
    }

    /// Whether the OS may send traffic right now
    pub fn allows_traffic(&self) -> bool {
        self.state().allows_traffic()
    }

    /// Whether the platform must drop traffic
    pub fn is_blocking(&self) -> bool {
        self.state().is_blocking()
    }

    /// Check if engaged
    pub fn is_engaged(&self) -> bool {
        self.inner.engaged.load(Ordering::SeqCst)
    }

    /// Start protecting traffic; blocks until the next `on_tunnel_up`
    pub fn engage(&self) {
        self.inner.tunnel_up.store(false, Ordering::SeqCst);
        if !self.inner.engaged.swap(true, Ordering::SeqCst) {
            debug!("Kill switch: engaged");
        }
        self.publish();
    }

    /// Stop protecting traffic
    pub fn release(&self) {
        if self.inner.engaged.swap(false, Ordering::SeqCst) {
            debug!("Kill switch: released");
        }
        self.publish();
    }

    /// Notify that the tunnel is up
    pub fn on_tunnel_up(&self) {
        self.inner.tunnel_up.store(true, Ordering::SeqCst);
        self.publish();
    }

    /// Notify that the tunnel is down
    pub fn on_tunnel_down(&self) {
        self.inner.tunnel_up.store(false, Ordering::SeqCst);
        if self.is_engaged() {
            warn!("Kill switch: tunnel down, blocking traffic");
        }
        self.publish();
    }

    fn publish(&self) {
        let state = self.state();
        self.inner.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_switch_released_by_default() {
        let ks = KillSwitch::new();

        assert_eq!(ks.state(), KillSwitchState::Disabled);
        assert!(ks.allows_traffic());
        assert!(!ks.is_blocking());
    }

    #[test]
    fn test_engaged_blocks_until_tunnel_up() {
        let ks = KillSwitch::new();
        ks.engage();
        assert_eq!(ks.state(), KillSwitchState::Blocking);

        ks.on_tunnel_up();
        assert_eq!(ks.state(), KillSwitchState::Armed);

        ks.on_tunnel_down();
        assert!(ks.is_blocking());

        ks.release();
        assert_eq!(ks.state(), KillSwitchState::Disabled);
    }

    #[test]
    fn test_state_is_published() {
        let ks = KillSwitch::new();
        let mut rx = ks.watch();

        ks.engage();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), KillSwitchState::Blocking);

        ks.engage();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_engage_forgets_previous_tunnel() {
        let ks = KillSwitch::new();
        ks.on_tunnel_up();
        ks.engage();
        assert_eq!(ks.state(), KillSwitchState::Blocking);

        ks.on_tunnel_up();
        ks.release();
        ks.engage();
        assert!(ks.is_blocking());
    }
}
