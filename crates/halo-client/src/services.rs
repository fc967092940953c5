//! Service container
//!
//! Builds the API client, realtime channel and VPN session once, wires
//! them together, and tears them down on logout or dispose. Nothing here
//! is global; the host owns the `ClientServices` value.

use crate::config::ClientConfig;
use anyhow::{Context, Result};
use halo_network::{ApiClient, AuthEvent, CredentialStore, Credentials, HttpTransport, Transport};
use halo_realtime::{ApiTicketProvider, RealtimeChannel, SocketConnector, TungsteniteConnector};
use halo_vpn::{
    ApiDeviceRegistrar, ApiServerDirectory, LaunchOutcome, NetworkObserver, SessionServices,
    TunnelEngine, VpnError, VpnSessionManager,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Platform pieces supplied by the host app
#[derive(Clone)]
pub struct Platform {
    pub engine: Arc<dyn TunnelEngine>,
    pub network: Arc<dyn NetworkObserver>,
    pub store: Arc<dyn CredentialStore>,
}

/// Wired client services
pub struct ClientServices {
    api: ApiClient,
    realtime: RealtimeChannel,
    vpn: VpnSessionManager,
    auth_watch: Mutex<Option<JoinHandle<()>>>,
}

impl ClientServices {
    /// Wire everything over HTTPS and a real websocket
    pub fn build(config: &ClientConfig, platform: Platform) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.http_transport()));
        let connector = Arc::new(TungsteniteConnector::new(config.api.connect_timeout));
        Self::with_transports(config, platform, transport, connector)
    }

    /// Wire everything over the given transport and socket connector
    pub fn with_transports(
        config: &ClientConfig,
        platform: Platform,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Self> {
        config.validate().context("invalid client configuration")?;

        let api = ApiClient::builder(transport, platform.store.clone())
            .retry_policy(config.retry_policy())
            .auth_config(config.auth_config())
            .build();

        let tickets = Arc::new(ApiTicketProvider::new(
            api.clone(),
            config.endpoints.ticket.clone(),
        ));
        let realtime = RealtimeChannel::new(config.realtime_config(), tickets, connector);

        let vpn = VpnSessionManager::new(
            SessionServices {
                engine: platform.engine,
                network: platform.network,
                directory: Arc::new(ApiServerDirectory::new(
                    api.clone(),
                    config.endpoints.servers.clone(),
                    config.endpoints.recommended_server.clone(),
                )),
                registrar: Arc::new(ApiDeviceRegistrar::new(
                    api.clone(),
                    config.endpoints.devices.clone(),
                )),
                store: platform.store,
            },
            config.vpn.clone(),
            config.watchdog_config(),
        );

        info!("Client: services built for {}", config.api.base_url);
        Ok(Self {
            api,
            realtime,
            vpn,
            auth_watch: Mutex::new(None),
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn realtime(&self) -> &RealtimeChannel {
        &self.realtime
    }

    pub fn vpn(&self) -> &VpnSessionManager {
        &self.vpn
    }

    /// Start listeners, open the push channel when signed in, and run
    /// VPN launch recovery
    pub async fn start(&self) -> LaunchOutcome {
        self.vpn.start();
        self.vpn.bind_realtime(self.realtime.events());
        self.watch_auth();

        let authenticated = self.api.auth().is_authenticated().await;
        if authenticated {
            if let Err(e) = self.realtime.connect().await {
                warn!("Client: realtime unavailable at start: {}", e);
            }
        }

        let outcome = self.vpn.restore_on_launch(authenticated).await;
        info!("Client: started ({:?})", outcome);
        outcome
    }

    /// Store tokens from a login flow and open the push channel
    pub async fn login(&self, credentials: &Credentials) -> Result<()> {
        self.api
            .auth()
            .set_credentials(credentials)
            .await
            .context("failed to store credentials")?;

        if let Err(e) = self.realtime.connect().await {
            warn!("Client: realtime unavailable after login: {}", e);
        }
        Ok(())
    }

    /// Drop the tunnel and push channel, then purge credentials
    pub async fn logout(&self) -> Result<()> {
        match self.vpn.disconnect().await {
            Ok(()) | Err(VpnError::InvalidState { .. }) => {}
            Err(e) => warn!("Client: VPN disconnect during logout failed: {}", e),
        }
        self.realtime.disconnect().await;

        self.api
            .auth()
            .logout()
            .await
            .context("failed to purge credentials")?;
        info!("Client: logged out");
        Ok(())
    }

    /// Stop all background work
    pub async fn dispose(&self) {
        if let Some(task) = self
            .auth_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.vpn.dispose();
        self.realtime.disconnect().await;
        debug!("Client: disposed");
    }

    /// Close the push channel when the session can no longer be renewed
    fn watch_auth(&self) {
        let mut events = self.api.auth().events();
        let realtime = self.realtime.clone();

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AuthEvent::SessionExpired { reason }) => {
                        warn!("Client: session expired ({}), closing realtime", reason);
                        realtime.disconnect().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => debug!("Client: missed {} auth events", skipped),
                    Err(RecvError::Closed) => return,
                }
            }
        });

        if let Some(previous) = self
            .auth_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }
}
