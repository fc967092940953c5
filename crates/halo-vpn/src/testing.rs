//! Fakes for the platform collaborators.

use crate::config::TunnelConfig;
use crate::engine::{
    DeviceRegistrar, EngineStatus, EngineUpdate, NetworkObserver, ServerDirectory, TunnelEngine,
};
use crate::error::{EngineError, VpnError};
use crate::server::{VpnProtocol, VpnServer};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

pub(crate) struct FakeEngine {
    connected: AtomicBool,
    fail_connects: AtomicU32,
    fail_disconnect: AtomicBool,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    connect_delay: Mutex<Duration>,
    last: Mutex<Option<TunnelConfig>>,
    updates: broadcast::Sender<EngineUpdate>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        let (updates, _) = broadcast::channel(32);
        Self {
            connected: AtomicBool::new(false),
            fail_connects: AtomicU32::new(0),
            fail_disconnect: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            last: Mutex::new(None),
            updates,
        }
    }

    /// Engine that survived an app restart with a live tunnel
    pub(crate) fn already_connected(config: TunnelConfig) -> Self {
        let engine = Self::new();
        engine.connected.store(true, Ordering::SeqCst);
        *engine.last.lock().unwrap() = Some(config);
        engine
    }

    pub(crate) fn fail_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_disconnect(&self) {
        self.fail_disconnect.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub(crate) fn emit(&self, update: EngineUpdate) {
        self.connected
            .store(update.status == EngineStatus::Connected, Ordering::SeqCst);
        let _ = self.updates.send(update);
    }

    pub(crate) fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_connect(&self) -> Option<TunnelConfig> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelEngine for FakeEngine {
    async fn connect(&self, config: &TunnelConfig) -> Result<(), EngineError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::ConnectFailed("handshake timed out".into()));
        }

        *self.last.lock().unwrap() = Some(config.clone());
        self.emit(EngineUpdate::new(EngineStatus::Connected));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(EngineError::DisconnectFailed("engine stuck".into()));
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn state_stream(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    async fn last_config(&self) -> Option<TunnelConfig> {
        self.last_connect()
    }
}

pub(crate) struct FakeNetwork {
    online: AtomicBool,
    changes: broadcast::Sender<bool>,
}

impl FakeNetwork {
    pub(crate) fn new(online: bool) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            online: AtomicBool::new(online),
            changes,
        }
    }

    pub(crate) fn set(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        let _ = self.changes.send(online);
    }
}

#[async_trait]
impl NetworkObserver for FakeNetwork {
    async fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.changes.subscribe()
    }
}

pub(crate) struct FakeDirectory {
    pub(crate) servers: Vec<VpnServer>,
    pub(crate) recommended: Option<VpnServer>,
}

#[async_trait]
impl ServerDirectory for FakeDirectory {
    async fn servers(&self) -> Result<Vec<VpnServer>, VpnError> {
        Ok(self.servers.clone())
    }

    async fn recommended_server(&self) -> Result<Option<VpnServer>, VpnError> {
        Ok(self.recommended.clone())
    }
}

#[derive(Default)]
pub(crate) struct FakeRegistrar {
    pub(crate) calls: Mutex<Vec<(String, VpnProtocol)>>,
}

#[async_trait]
impl DeviceRegistrar for FakeRegistrar {
    async fn register_device(&self, server: &VpnServer, protocol: VpnProtocol) -> Result<(), VpnError> {
        self.calls.lock().unwrap().push((server.id.clone(), protocol));
        Ok(())
    }
}
