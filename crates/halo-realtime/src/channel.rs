//! Realtime Channel
//!
//! Maintains the push-event socket.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──socket open──▶ Connected
//!      ▲                          │                           │
//!      │ no ticket                │ failure                   │ stream error / close
//!      └──────────────────────────┴──────▶ Reconnecting ◀─────┘
//!                                          (backoff timer)
//! ```
//!
//! - `connect()` is idempotent and single-flight: concurrent callers share
//!   one attempt and its outcome
//! - `disconnect()` cancels a pending reconnect timer, closes the socket
//!   normally and is safe to repeat
//! - `force_disconnect` events are delivered, then the channel closes and
//!   stays closed until the next explicit `connect()`
//!
//! Every explicit connect/disconnect bumps a generation counter; tasks
//! from an older generation find the counter moved and exit quietly.

use crate::backoff::{BackoffConfig, ReconnectBackoff};
use crate::error::RealtimeError;
use crate::event::WebSocketEvent;
use crate::socket::{Socket, SocketConnector};
use crate::ticket::TicketProvider;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// API base URL; `http`/`https` are mapped to `ws`/`wss`
    pub base_url: Url,
    /// Socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_socket_path() -> String {
    "/ws".to_string()
}

impl RealtimeConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            socket_path: default_socket_path(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Socket URL carrying `ticket`
    pub fn socket_url(&self, ticket: &str) -> Result<Url, RealtimeError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = self.socket_path.trim_start_matches('/');
        let mut url = Url::parse(&format!("{}/{}", base, path))
            .map_err(|e| RealtimeError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => return Err(RealtimeError::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::InvalidUrl("cannot switch to websocket scheme".to_string()))?;
        url.query_pairs_mut().append_pair("ticket", ticket);
        Ok(url)
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), RealtimeError>>>;

struct Control {
    generation: u64,
    connecting: Option<ConnectFuture>,
    session: Option<CancellationToken>,
    reconnect: Option<JoinHandle<()>>,
    backoff: ReconnectBackoff,
    /// Set by a server force-disconnect; cleared by an explicit connect
    suppressed: bool,
}

struct ChannelInner {
    config: RealtimeConfig,
    tickets: Arc<dyn TicketProvider>,
    connector: Arc<dyn SocketConnector>,
    state: watch::Sender<WebSocketConnectionState>,
    events: broadcast::Sender<WebSocketEvent>,
    control: Mutex<Control>,
}

/// Push-event channel
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(
        config: RealtimeConfig,
        tickets: Arc<dyn TicketProvider>,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let (state, _) = watch::channel(WebSocketConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let backoff = ReconnectBackoff::new(config.backoff.clone());

        Self {
            inner: Arc::new(ChannelInner {
                config,
                tickets,
                connector,
                state,
                events,
                control: Mutex::new(Control {
                    generation: 0,
                    connecting: None,
                    session: None,
                    reconnect: None,
                    backoff,
                    suppressed: false,
                }),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> WebSocketConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<WebSocketConnectionState> {
        self.inner.state.subscribe()
    }

    /// Inbound events in receipt order
    pub fn events(&self) -> broadcast::Receiver<WebSocketEvent> {
        self.inner.events.subscribe()
    }

    /// Open the socket, or join the attempt already in flight
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let attempt = {
            let mut control = self.inner.lock();
            control.suppressed = false;

            if let Some(connecting) = &control.connecting {
                connecting.clone()
            } else if control.session.is_some() {
                return Ok(());
            } else {
                if let Some(timer) = control.reconnect.take() {
                    timer.abort();
                }
                control.generation += 1;
                self.inner.start_attempt(&mut control, false)
            }
        };

        attempt.await
    }

    /// Close the socket and cancel any pending reconnect
    pub async fn disconnect(&self) {
        let session = {
            let mut control = self.inner.lock();
            control.generation += 1;
            control.connecting = None;
            control.backoff.reset();
            if let Some(timer) = control.reconnect.take() {
                timer.abort();
            }
            control.session.take()
        };

        if let Some(token) = session {
            info!("Realtime: disconnecting");
            token.cancel();
        }
        self.inner.set_state(WebSocketConnectionState::Disconnected);
    }
}

impl ChannelInner {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WebSocketConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Realtime: {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }

    /// Spawn one connect attempt for the current generation
    fn start_attempt(self: &Arc<Self>, control: &mut Control, reconnecting: bool) -> ConnectFuture {
        let generation = control.generation;
        self.set_state(if reconnecting {
            WebSocketConnectionState::Reconnecting
        } else {
            WebSocketConnectionState::Connecting
        });

        let task = tokio::spawn(self.clone().establish(generation));
        let attempt = async move {
            task.await
                .unwrap_or_else(|e| Err(RealtimeError::Connect(e.to_string())))
        }
        .boxed()
        .shared();

        control.connecting = Some(attempt.clone());
        attempt
    }

    async fn establish(self: Arc<Self>, generation: u64) -> Result<(), RealtimeError> {
        let opened = self.open().await;

        let stale = {
            let control = self.lock();
            if control.generation == generation {
                return self.finish_attempt(control, opened, generation);
            }
            opened
        };

        if let Ok(Some(mut socket)) = stale {
            socket.close().await;
        }
        Err(RealtimeError::Cancelled)
    }

    /// Record the outcome of a current-generation attempt
    fn finish_attempt(
        self: &Arc<Self>,
        mut control: MutexGuard<'_, Control>,
        opened: Result<Option<Box<dyn Socket>>, RealtimeError>,
        generation: u64,
    ) -> Result<(), RealtimeError> {
        control.connecting = None;

        match opened {
            Ok(Some(socket)) => {
                control.backoff.reset();
                let token = CancellationToken::new();
                control.session = Some(token.clone());
                drop(control);

                info!("Realtime: connected");
                self.set_state(WebSocketConnectionState::Connected);
                tokio::spawn(self.clone().read_loop(socket, token, generation));
                Ok(())
            }
            Ok(None) => {
                drop(control);
                debug!("Realtime: no ticket, staying disconnected");
                self.set_state(WebSocketConnectionState::Disconnected);
                Ok(())
            }
            Err(e) => {
                warn!("Realtime: connect failed: {}", e);
                self.schedule_reconnect(&mut control);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<Option<Box<dyn Socket>>, RealtimeError> {
        let Some(ticket) = self.tickets.fetch_ticket().await? else {
            return Ok(None);
        };
        let url = self.config.socket_url(&ticket)?;
        self.connector.connect(url.as_str()).await.map(Some)
    }

    async fn read_loop(
        self: Arc<Self>,
        mut socket: Box<dyn Socket>,
        token: CancellationToken,
        generation: u64,
    ) {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => {
                    socket.close().await;
                    return;
                }
                frame = socket.next_frame() => frame,
            };

            match frame {
                Some(Ok(text)) => match WebSocketEvent::parse(&text) {
                    Ok(event) => {
                        let forced = matches!(event, WebSocketEvent::ForceDisconnect { .. });
                        debug!("Realtime: event {}", event.kind());
                        let _ = self.events.send(event);
                        if forced {
                            self.forced_close(generation);
                            socket.close().await;
                            return;
                        }
                    }
                    Err(e) => warn!("Realtime: dropping frame: {}", e),
                },
                Some(Err(e)) => {
                    warn!("Realtime: stream error: {}", e);
                    break;
                }
                None => {
                    info!("Realtime: socket closed by server");
                    break;
                }
            }
        }

        let mut control = self.lock();
        if control.generation == generation && control.session.is_some() {
            control.session = None;
            self.schedule_reconnect(&mut control);
        }
    }

    fn forced_close(&self, generation: u64) {
        let mut control = self.lock();
        if control.generation != generation {
            return;
        }
        warn!("Realtime: force-disconnected by server, auto-reconnect suppressed");
        control.suppressed = true;
        control.session = None;
        drop(control);
        self.set_state(WebSocketConnectionState::Disconnected);
    }

    fn schedule_reconnect(self: &Arc<Self>, control: &mut Control) {
        if control.suppressed {
            self.set_state(WebSocketConnectionState::Disconnected);
            return;
        }

        let delay = control.backoff.next_delay();
        let generation = control.generation;
        info!(
            "Realtime: reconnecting in {:?} (attempt {})",
            delay,
            control.backoff.attempt()
        );
        self.set_state(WebSocketConnectionState::Reconnecting);

        let inner = self.clone();
        control.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let attempt = {
                let mut control = inner.lock();
                if control.generation != generation || control.connecting.is_some() {
                    return;
                }
                control.reconnect = None;
                inner.start_attempt(&mut control, true)
            };
            let _ = attempt.await;
        }));
    }
}
