//! Auto-reconnect watchdog
//!
//! Runs while a session is connected. When the engine reports the tunnel
//! down, or connectivity returns while the tunnel is down, it re-issues
//! the engine connect with backoff and reports progress:
//!
//! - `Attempt(n)` before the n-th try (1-based)
//! - `Recovered` once the engine is back, or when connectivity returns
//!   after an outage the tunnel survived
//! - `GaveUp` after `max_attempts` failures; the watchdog then stops

use crate::config::TunnelConfig;
use crate::engine::{NetworkObserver, TunnelEngine};
use halo_realtime::{BackoffConfig, ReconnectBackoff};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watchdog configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    /// Engine connect attempts before giving up
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig {
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                jitter_ratio: 0.0,
            },
        }
    }
}

/// Progress reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    Attempt(u32),
    Recovered,
    GaveUp,
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Engine re-establishment loop
pub struct AutoReconnectWatchdog {
    engine: Arc<dyn TunnelEngine>,
    network: Arc<dyn NetworkObserver>,
    config: WatchdogConfig,
    events: broadcast::Sender<WatchdogEvent>,
    running: Mutex<Option<Running>>,
}

enum Outcome {
    Recovered,
    GaveUp,
    Stopped,
}

impl AutoReconnectWatchdog {
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        network: Arc<dyn NetworkObserver>,
        config: WatchdogConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            engine,
            network,
            config,
            events,
            running: Mutex::new(None),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Watch the tunnel described by `tunnel`, replacing any previous run
    pub fn start(&self, tunnel: TunnelConfig) {
        let token = CancellationToken::new();
        let worker = Worker {
            engine: self.engine.clone(),
            network: self.network.clone(),
            events: self.events.clone(),
            backoff: ReconnectBackoff::new(self.config.backoff.clone()),
            max_attempts: self.config.max_attempts,
            tunnel,
            token: token.clone(),
        };

        // Subscribe before returning so no report is missed
        let engine_rx = self.engine.state_stream();
        let network_rx = self.network.subscribe();
        let task = tokio::spawn(worker.run(engine_rx, network_rx));

        if let Some(previous) = self.lock().replace(Running { token, task }) {
            previous.token.cancel();
        }
        debug!("Watchdog: started");
    }

    pub fn stop(&self) {
        if let Some(running) = self.lock().take() {
            running.token.cancel();
            debug!("Watchdog: stopped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AutoReconnectWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    engine: Arc<dyn TunnelEngine>,
    network: Arc<dyn NetworkObserver>,
    events: broadcast::Sender<WatchdogEvent>,
    backoff: ReconnectBackoff,
    max_attempts: u32,
    tunnel: TunnelConfig,
    token: CancellationToken,
}

impl Worker {
    async fn run(
        mut self,
        mut engine_rx: broadcast::Receiver<crate::engine::EngineUpdate>,
        mut network_rx: broadcast::Receiver<bool>,
    ) {
        let mut offline = false;
        loop {
            let needs_recovery = tokio::select! {
                _ = self.token.cancelled() => return,
                update = engine_rx.recv() => match update {
                    Ok(update) => update.is_down(),
                    Err(RecvError::Lagged(_)) => !self.engine.is_connected().await,
                    Err(RecvError::Closed) => return,
                },
                online = network_rx.recv() => match online {
                    Ok(false) => {
                        offline = true;
                        false
                    }
                    Ok(true) => {
                        let alive = self.engine.is_connected().await;
                        if alive && std::mem::take(&mut offline) {
                            info!("Watchdog: network back, tunnel survived");
                            let _ = self.events.send(WatchdogEvent::Recovered);
                        }
                        !alive
                    }
                    Err(RecvError::Lagged(_)) => false,
                    Err(RecvError::Closed) => return,
                },
            };

            if !needs_recovery {
                continue;
            }

            offline = false;
            match self.recover().await {
                Outcome::Recovered => {
                    // Reports queued during recovery are stale
                    engine_rx = engine_rx.resubscribe();
                    network_rx = network_rx.resubscribe();
                }
                Outcome::GaveUp | Outcome::Stopped => return,
            }
        }
    }

    async fn recover(&mut self) -> Outcome {
        loop {
            if self.backoff.attempt() >= self.max_attempts {
                warn!("Watchdog: giving up after {} attempts", self.max_attempts);
                let _ = self.events.send(WatchdogEvent::GaveUp);
                return Outcome::GaveUp;
            }

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            let _ = self.events.send(WatchdogEvent::Attempt(attempt));
            info!(
                "Watchdog: reconnect attempt {}/{} in {:?}",
                attempt, self.max_attempts, delay
            );

            tokio::select! {
                _ = self.token.cancelled() => return Outcome::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.network.is_connected().await {
                debug!("Watchdog: still offline, attempt {} skipped", attempt);
                continue;
            }

            let result = tokio::select! {
                _ = self.token.cancelled() => return Outcome::Stopped,
                result = self.engine.connect(&self.tunnel) => result,
            };

            match result {
                Ok(()) => {
                    info!("Watchdog: tunnel re-established");
                    self.backoff.reset();
                    let _ = self.events.send(WatchdogEvent::Recovered);
                    return Outcome::Recovered;
                }
                Err(e) => warn!("Watchdog: attempt {} failed: {}", attempt, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, FakeNetwork};
    use crate::engine::{EngineStatus, EngineUpdate};
    use crate::server::{VpnProtocol, VpnServer};

    fn tunnel() -> TunnelConfig {
        TunnelConfig {
            server: VpnServer::new("de-1", "de1.halo.test"),
            protocol: VpnProtocol::WireGuard,
            dns_servers: vec![],
            kill_switch: false,
        }
    }

    fn fast() -> WatchdogConfig {
        WatchdogConfig {
            max_attempts: 3,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
                jitter_ratio: 0.0,
            },
        }
    }

    async fn drain(rx: &mut broadcast::Receiver<WatchdogEvent>) -> Vec<WatchdogEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_drop_triggers_reconnect() {
        let engine = Arc::new(FakeEngine::new());
        let network = Arc::new(FakeNetwork::new(true));
        let watchdog = AutoReconnectWatchdog::new(engine.clone(), network, fast());
        let mut events = watchdog.events();

        watchdog.start(tunnel());
        engine.fail_connects(1);
        engine.emit(EngineUpdate::new(EngineStatus::Disconnected));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            drain(&mut events).await,
            vec![
                WatchdogEvent::Attempt(1),
                WatchdogEvent::Attempt(2),
                WatchdogEvent::Recovered
            ]
        );
        assert_eq!(engine.connect_calls(), 2);
        assert!(watchdog.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let engine = Arc::new(FakeEngine::new());
        let network = Arc::new(FakeNetwork::new(true));
        let watchdog = AutoReconnectWatchdog::new(engine.clone(), network, fast());
        let mut events = watchdog.events();

        watchdog.start(tunnel());
        engine.fail_connects(10);
        engine.emit(EngineUpdate::new(EngineStatus::Error));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let seen = drain(&mut events).await;
        assert_eq!(seen.last(), Some(&WatchdogEvent::GaveUp));
        assert_eq!(engine.connect_calls(), 3);
        assert!(!watchdog.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_restore_reconnects_dead_tunnel() {
        let engine = Arc::new(FakeEngine::new());
        let network = Arc::new(FakeNetwork::new(false));
        let watchdog = AutoReconnectWatchdog::new(engine.clone(), network.clone(), fast());
        let mut events = watchdog.events();

        watchdog.start(tunnel());
        network.set(true);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            drain(&mut events).await,
            vec![WatchdogEvent::Attempt(1), WatchdogEvent::Recovered]
        );
        assert_eq!(engine.last_connect().unwrap().server.id, "de-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_with_live_tunnel_reports_recovery() {
        let engine = Arc::new(FakeEngine::already_connected(tunnel()));
        let network = Arc::new(FakeNetwork::new(true));
        let watchdog = AutoReconnectWatchdog::new(engine.clone(), network.clone(), fast());
        let mut events = watchdog.events();

        watchdog.start(tunnel());
        network.set(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(drain(&mut events).await.is_empty());

        network.set(false);
        network.set(true);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(drain(&mut events).await, vec![WatchdogEvent::Recovered]);
        assert_eq!(engine.connect_calls(), 0);
        assert!(watchdog.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_recovery() {
        let engine = Arc::new(FakeEngine::new());
        let network = Arc::new(FakeNetwork::new(true));
        let watchdog = AutoReconnectWatchdog::new(engine.clone(), network, fast());

        watchdog.start(tunnel());
        engine.emit(EngineUpdate::new(EngineStatus::Disconnected));
        tokio::time::sleep(Duration::from_millis(10)).await;
        watchdog.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(engine.connect_calls(), 0);
        assert!(!watchdog.is_running());
    }
}
