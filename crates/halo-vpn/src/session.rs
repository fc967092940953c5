//! VPN Session Manager
//!
//! Drives the tunnel engine through the connection state machine and keeps
//! the kill switch, DNS, watchdog and persisted last-connection record in
//! step with it.
//!
//! # Usage
//!
//! ```rust,ignore
//! let vpn = VpnSessionManager::new(services, settings, WatchdogConfig::default());
//! vpn.start();
//! vpn.bind_realtime(realtime.events());
//! vpn.restore_on_launch(authenticated).await;
//!
//! let _sub = vpn.subscribe(|state| println!("{}", state));
//! vpn.connect(server).await?;
//! vpn.disconnect().await?;
//! ```
//!
//! State changes are check-and-set on a `watch` channel, so two racing
//! `connect()` calls cannot both leave `Disconnected`. Completion of a
//! connect and a whole disconnect are serialized by an operation lock;
//! the engine call itself is not, so `disconnect()` can interrupt a
//! connect that is still waiting on the engine.

use crate::config::{TunnelConfig, VpnSettings};
use crate::engine::{
    DeviceRegistrar, EngineStatus, EngineUpdate, NetworkObserver, ServerDirectory, TunnelEngine,
};
use crate::error::VpnError;
use crate::kill_switch::KillSwitch;
use crate::persistence::{ConnectionRecord, ConnectionStore};
use crate::server::{VpnProtocol, VpnServer};
use crate::state::VpnConnectionState;
use crate::watchdog::{AutoReconnectWatchdog, WatchdogConfig, WatchdogEvent};
use halo_network::CredentialStore;
use halo_realtime::WebSocketEvent;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborators the session drives
#[derive(Clone)]
pub struct SessionServices {
    pub engine: Arc<dyn TunnelEngine>,
    pub network: Arc<dyn NetworkObserver>,
    pub directory: Arc<dyn ServerDirectory>,
    pub registrar: Arc<dyn DeviceRegistrar>,
    pub store: Arc<dyn CredentialStore>,
}

/// What `restore_on_launch` did
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    /// A tunnel that outlived the app was adopted
    Restored,
    AutoConnected(VpnServer),
    AutoConnectFailed(String),
    /// Nothing to do
    Idle,
}

/// Live state listener; dropping it unsubscribes
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SessionInner {
    engine: Arc<dyn TunnelEngine>,
    network: Arc<dyn NetworkObserver>,
    directory: Arc<dyn ServerDirectory>,
    registrar: Arc<dyn DeviceRegistrar>,
    connections: ConnectionStore,
    kill_switch: KillSwitch,
    watchdog: AutoReconnectWatchdog,
    settings: RwLock<VpnSettings>,
    state: watch::Sender<VpnConnectionState>,
    changes: broadcast::Sender<VpnConnectionState>,
    dns: watch::Sender<Vec<IpAddr>>,
    active: Mutex<Option<TunnelConfig>>,
    ops: tokio::sync::Mutex<()>,
    auto_connect_attempted: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// VPN session state machine
#[derive(Clone)]
pub struct VpnSessionManager {
    inner: Arc<SessionInner>,
}

impl VpnSessionManager {
    pub fn new(services: SessionServices, settings: VpnSettings, watchdog: WatchdogConfig) -> Self {
        let (state, _) = watch::channel(VpnConnectionState::Disconnected);
        let (changes, _) = broadcast::channel(64);
        let (dns, _) = watch::channel(Vec::new());
        let watchdog = AutoReconnectWatchdog::new(
            services.engine.clone(),
            services.network.clone(),
            watchdog,
        );

        Self {
            inner: Arc::new(SessionInner {
                engine: services.engine,
                network: services.network,
                directory: services.directory,
                registrar: services.registrar,
                connections: ConnectionStore::new(services.store),
                kill_switch: KillSwitch::new(),
                watchdog,
                settings: RwLock::new(settings),
                state,
                changes,
                dns,
                active: Mutex::new(None),
                ops: tokio::sync::Mutex::new(()),
                auto_connect_attempted: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> VpnConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Latest-value view of the state
    pub fn watch(&self) -> watch::Receiver<VpnConnectionState> {
        self.inner.state.subscribe()
    }

    /// Every accepted transition, in order
    pub fn changes(&self) -> broadcast::Receiver<VpnConnectionState> {
        self.inner.changes.subscribe()
    }

    /// Call `listener` on every state change until the subscription drops
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&VpnConnectionState) + Send + 'static,
    {
        let mut rx = self.inner.state.subscribe();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                listener(&state);
            }
        });
        Subscription { task }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.inner.kill_switch
    }

    /// Resolver addresses handed to the tunnel; empty means system DNS
    pub fn dns_servers(&self) -> watch::Receiver<Vec<IpAddr>> {
        self.inner.dns.subscribe()
    }

    pub fn settings(&self) -> VpnSettings {
        self.inner.settings().clone()
    }

    /// Replace settings; they apply from the next connect
    pub fn update_settings(&self, settings: VpnSettings) -> Result<(), VpnError> {
        settings.validate()?;
        *self.inner.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }

    /// Bring a tunnel up to `server`
    pub async fn connect(&self, server: VpnServer) -> Result<(), VpnError> {
        self.inner.connect(server).await
    }

    /// Tear the tunnel down
    pub async fn disconnect(&self) -> Result<(), VpnError> {
        self.inner.disconnect().await
    }

    /// Disconnect on the server's behalf and record why
    pub async fn force_disconnect(&self, reason: &str) {
        self.inner.force_disconnect(reason).await
    }

    /// Adopt a surviving tunnel, or auto-connect if configured
    pub async fn restore_on_launch(&self, authenticated: bool) -> LaunchOutcome {
        self.inner.restore_on_launch(authenticated).await
    }

    /// Start following connectivity, engine and watchdog reports
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        let network = self.inner.network.subscribe();
        let engine = self.inner.engine.state_stream();
        let watchdog = self.inner.watchdog.events();

        let mut tasks = self.inner.tasks();
        tasks.push(tokio::spawn(follow_network(weak.clone(), network)));
        tasks.push(tokio::spawn(follow_engine(weak.clone(), engine)));
        tasks.push(tokio::spawn(follow_watchdog(weak, watchdog)));
        debug!("VPN: session listeners started");
    }

    /// Honour server force-disconnects arriving on `events`
    pub fn bind_realtime(&self, events: broadcast::Receiver<WebSocketEvent>) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks()
            .push(tokio::spawn(follow_realtime(weak, events)));
    }

    /// Stop background work; the tunnel itself is left as is
    pub fn dispose(&self) {
        self.inner.watchdog.stop();
        for task in self.inner.tasks().drain(..) {
            task.abort();
        }
        debug!("VPN: session disposed");
    }
}

impl SessionInner {
    fn settings(&self) -> std::sync::RwLockReadGuard<'_, VpnSettings> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, Option<TunnelConfig>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> VpnConnectionState {
        self.state.borrow().clone()
    }

    fn is_connecting(&self) -> bool {
        matches!(*self.state.borrow(), VpnConnectionState::Connecting { .. })
    }

    /// Atomically move to the state `next` picks, if it is a legal edge
    fn update<F>(&self, next: F) -> bool
    where
        F: FnOnce(&VpnConnectionState) -> Option<VpnConnectionState>,
    {
        let mut accepted = None;
        self.state.send_if_modified(|current| {
            let Some(target) = next(current) else {
                return false;
            };
            if *current == target {
                return false;
            }
            if !current.can_transition_to(&target) {
                warn!("VPN: rejected transition {} -> {}", current.name(), target.name());
                return false;
            }
            info!("VPN: {} -> {}", current.name(), target.name());
            *current = target.clone();
            accepted = Some(target);
            true
        });

        match accepted {
            Some(state) => {
                let _ = self.changes.send(state);
                true
            }
            None => false,
        }
    }

    fn invalid(&self, operation: &'static str) -> VpnError {
        VpnError::InvalidState {
            operation,
            state: self.current().name().to_string(),
        }
    }

    async fn connect(&self, server: VpnServer) -> Result<(), VpnError> {
        let target = server.clone();
        let accepted = self.update(move |current| match current {
            VpnConnectionState::Connected { .. } | VpnConnectionState::Connecting { .. } => None,
            _ => Some(VpnConnectionState::Connecting {
                server: Some(target),
            }),
        });
        if !accepted {
            debug!("VPN: connect ignored while {}", self.current().name());
            return Err(self.invalid("connect"));
        }

        let config = self.settings().tunnel_config(&server);
        let config = match config {
            Ok(config) => config,
            Err(e) => return Err(self.fail_connect(e).await),
        };

        let _ = self.dns.send_replace(config.dns_servers.clone());
        if config.kill_switch {
            self.kill_switch.engage();
        }

        info!("VPN: connecting to {} via {}", server, config.protocol);
        if let Err(e) = self.engine.connect(&config).await {
            return Err(self.fail_connect(e.into()).await);
        }

        self.finish_connect(config).await
    }

    async fn finish_connect(&self, config: TunnelConfig) -> Result<(), VpnError> {
        let _ops = self.ops.lock().await;

        if !self.is_connecting() {
            info!("VPN: connect superseded while {}, tearing tunnel down", self.current().name());
            if let Err(e) = self.engine.disconnect().await {
                warn!("VPN: teardown after superseded connect failed: {}", e);
            }
            return Err(VpnError::Cancelled);
        }

        let record = ConnectionRecord {
            server: config.server.clone(),
            protocol: config.protocol,
        };
        if let Err(e) = self.connections.save(&record).await {
            warn!("VPN: failed to persist last connection: {}", e);
        }

        self.kill_switch.on_tunnel_up();
        *self.active() = Some(config.clone());
        self.watchdog.start(config.clone());
        self.spawn_registration(config.server.clone(), config.protocol);

        self.update(|_| {
            Some(VpnConnectionState::Connected {
                server: config.server,
                protocol: config.protocol,
            })
        });
        Ok(())
    }

    async fn fail_connect(&self, error: VpnError) -> VpnError {
        let _ops = self.ops.lock().await;
        if !self.is_connecting() {
            return error;
        }

        error!("VPN: connect failed: {}", error);
        self.watchdog.stop();
        self.kill_switch.release();
        if let Err(e) = self.engine.disconnect().await {
            debug!("VPN: cleanup disconnect failed: {}", e);
        }
        *self.active() = None;

        let message = error.to_string();
        self.update(|_| Some(VpnConnectionState::Error { message }));
        error
    }

    fn spawn_registration(&self, server: VpnServer, protocol: VpnProtocol) {
        let registrar = self.registrar.clone();
        tokio::spawn(async move {
            match registrar.register_device(&server, protocol).await {
                Ok(()) => debug!("VPN: device registered with {}", server.id),
                Err(e) => warn!("VPN: device registration with {} failed: {}", server.id, e),
            }
        });
    }

    async fn disconnect(&self) -> Result<(), VpnError> {
        let _ops = self.ops.lock().await;

        let accepted = self.update(|current| match current {
            VpnConnectionState::Disconnected | VpnConnectionState::Disconnecting => None,
            _ => Some(VpnConnectionState::Disconnecting),
        });
        if !accepted {
            return Err(self.invalid("disconnect"));
        }

        self.watchdog.stop();

        if let Err(e) = self.engine.disconnect().await {
            error!("VPN: disconnect failed: {}", e);
            let message = e.to_string();
            self.update(|_| Some(VpnConnectionState::Error { message }));
            return Err(e.into());
        }

        if let Err(e) = self.connections.clear().await {
            warn!("VPN: failed to clear last connection: {}", e);
        }
        self.kill_switch.release();
        self.kill_switch.on_tunnel_down();
        *self.active() = None;
        let _ = self.dns.send_replace(Vec::new());

        self.update(|_| Some(VpnConnectionState::Disconnected));
        Ok(())
    }

    async fn force_disconnect(&self, reason: &str) {
        warn!("VPN: disconnected by server: {}", reason);
        match self.disconnect().await {
            Ok(()) | Err(VpnError::InvalidState { .. }) => {}
            Err(e) => warn!("VPN: disconnect during force-disconnect failed: {}", e),
        }

        let reason = reason.to_string();
        self.update(|_| Some(VpnConnectionState::ForceDisconnected { reason }));
    }

    async fn restore_on_launch(&self, authenticated: bool) -> LaunchOutcome {
        let record = match self.connections.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!("VPN: could not read last connection: {}", e);
                None
            }
        };

        if let Some(record) = &record {
            if self.engine.is_connected().await && self.adopt(record).await {
                return LaunchOutcome::Restored;
            }
        }

        if !self.settings().auto_connect_on_launch {
            return LaunchOutcome::Idle;
        }
        if !authenticated {
            debug!("VPN: auto-connect skipped, not signed in");
            return LaunchOutcome::Idle;
        }
        if self.auto_connect_attempted.swap(true, Ordering::SeqCst) {
            return LaunchOutcome::Idle;
        }

        let server = match self.auto_connect_target(record).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                warn!("VPN: auto-connect found no server");
                return LaunchOutcome::AutoConnectFailed(VpnError::NoServer.to_string());
            }
            Err(e) => {
                warn!("VPN: auto-connect could not pick a server: {}", e);
                return LaunchOutcome::AutoConnectFailed(e.to_string());
            }
        };

        info!("VPN: auto-connecting to {}", server);
        match self.connect(server.clone()).await {
            Ok(()) => LaunchOutcome::AutoConnected(server),
            Err(e) => {
                warn!("VPN: auto-connect failed: {}", e);
                LaunchOutcome::AutoConnectFailed(e.to_string())
            }
        }
    }

    /// Rebuild `Connected` for a tunnel the engine kept alive
    async fn adopt(&self, record: &ConnectionRecord) -> bool {
        let _ops = self.ops.lock().await;

        let config = match self.engine.last_config().await {
            Some(config) => config,
            None => {
                let settings = self.settings().clone();
                TunnelConfig {
                    server: record.server.clone(),
                    protocol: record.protocol,
                    dns_servers: settings.dns.resolve().unwrap_or_default(),
                    kill_switch: settings.kill_switch,
                }
            }
        };

        let server = record.server.clone();
        if !self.update(|_| Some(VpnConnectionState::Connecting { server: Some(server) })) {
            return false;
        }

        info!("VPN: adopting live tunnel to {}", record.server);
        if config.kill_switch {
            self.kill_switch.engage();
        }
        self.kill_switch.on_tunnel_up();
        let _ = self.dns.send_replace(config.dns_servers.clone());
        *self.active() = Some(config.clone());
        self.watchdog.start(config);

        self.update(|_| {
            Some(VpnConnectionState::Connected {
                server: record.server.clone(),
                protocol: record.protocol,
            })
        })
    }

    async fn auto_connect_target(
        &self,
        record: Option<ConnectionRecord>,
    ) -> Result<Option<VpnServer>, VpnError> {
        if let Some(record) = record {
            let servers = self.directory.servers().await?;
            if let Some(server) = servers
                .into_iter()
                .find(|s| s.id == record.server.id && s.is_available)
            {
                return Ok(Some(server));
            }
            info!("VPN: last server {} unavailable, using recommended", record.server.id);
        }
        self.directory.recommended_server().await
    }

    fn on_network_lost(&self) {
        self.update(|current| match current {
            VpnConnectionState::Connected { server, .. } => Some(VpnConnectionState::Reconnecting {
                attempt: 1,
                server: Some(server.clone()),
            }),
            _ => None,
        });
    }

    /// The engine came back by itself; an offline report means it is stale
    async fn on_engine_connected(&self) {
        if !self.network.is_connected().await {
            debug!("VPN: engine up while offline, waiting for the network");
            return;
        }
        self.on_tunnel_restored();
    }

    fn on_tunnel_restored(&self) {
        let Some(config) = self.active().clone() else {
            return;
        };
        let restored = self.update(|current| match current {
            VpnConnectionState::Reconnecting { .. } => Some(VpnConnectionState::Connected {
                server: config.server,
                protocol: config.protocol,
            }),
            _ => None,
        });
        if restored {
            self.kill_switch.on_tunnel_up();
        }
    }

    fn on_tunnel_down(&self) {
        if matches!(
            *self.state.borrow(),
            VpnConnectionState::Connected { .. } | VpnConnectionState::Reconnecting { .. }
        ) {
            self.kill_switch.on_tunnel_down();
        }
    }

    fn on_watchdog_attempt(&self, attempt: u32) {
        self.update(|current| match current {
            VpnConnectionState::Connected { server, .. } => Some(VpnConnectionState::Reconnecting {
                attempt,
                server: Some(server.clone()),
            }),
            VpnConnectionState::Reconnecting { server, .. } => Some(VpnConnectionState::Reconnecting {
                attempt,
                server: server.clone(),
            }),
            _ => None,
        });
    }

    fn on_watchdog_gave_up(&self) {
        let stopped = self.update(|current| match current {
            VpnConnectionState::Reconnecting { .. } => Some(VpnConnectionState::Disconnected),
            _ => None,
        });
        if stopped {
            // The record stays for the next launch
            self.kill_switch.release();
            self.kill_switch.on_tunnel_down();
            *self.active() = None;
        }
    }
}

async fn follow_network(session: Weak<SessionInner>, mut rx: broadcast::Receiver<bool>) {
    loop {
        match rx.recv().await {
            Ok(online) => {
                let Some(inner) = session.upgrade() else { return };
                if online {
                    debug!("VPN: network restored");
                } else {
                    inner.on_network_lost();
                }
            }
            Err(RecvError::Lagged(skipped)) => debug!("VPN: missed {} network reports", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn follow_engine(
    session: Weak<SessionInner>,
    mut rx: broadcast::Receiver<EngineUpdate>,
) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                let Some(inner) = session.upgrade() else { return };
                if update.status == EngineStatus::Connected {
                    inner.on_engine_connected().await;
                } else if update.is_down() {
                    if let Some(message) = &update.error_message {
                        debug!("VPN: engine reported {:?}: {}", update.status, message);
                    }
                    inner.on_tunnel_down();
                }
            }
            Err(RecvError::Lagged(skipped)) => debug!("VPN: missed {} engine reports", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn follow_watchdog(session: Weak<SessionInner>, mut rx: broadcast::Receiver<WatchdogEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(inner) = session.upgrade() else { return };
                match event {
                    WatchdogEvent::Attempt(attempt) => inner.on_watchdog_attempt(attempt),
                    WatchdogEvent::Recovered => inner.on_tunnel_restored(),
                    WatchdogEvent::GaveUp => inner.on_watchdog_gave_up(),
                }
            }
            Err(RecvError::Lagged(skipped)) => debug!("VPN: missed {} watchdog reports", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn follow_realtime(session: Weak<SessionInner>, mut rx: broadcast::Receiver<WebSocketEvent>) {
    loop {
        match rx.recv().await {
            Ok(WebSocketEvent::ForceDisconnect { reason }) => {
                let Some(inner) = session.upgrade() else { return };
                inner.force_disconnect(&reason).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("VPN: missed {} realtime events", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}
