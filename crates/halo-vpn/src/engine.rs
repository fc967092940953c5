//! Platform collaborators
//!
//! The packet-forwarding engine, connectivity monitoring and the server
//! catalogue live outside this crate; the session drives them through
//! these traits.

use crate::config::TunnelConfig;
use crate::error::{EngineError, VpnError};
use crate::server::{VpnProtocol, VpnServer};
use async_trait::async_trait;
use halo_network::ApiClient;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Engine-reported tunnel status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// One engine status report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineUpdate {
    pub status: EngineStatus,
    pub error_message: Option<String>,
}

impl EngineUpdate {
    pub fn new(status: EngineStatus) -> Self {
        Self {
            status,
            error_message: None,
        }
    }

    /// Check if the tunnel went away
    pub fn is_down(&self) -> bool {
        matches!(self.status, EngineStatus::Disconnected | EngineStatus::Error)
    }
}

/// Platform tunnel engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    async fn connect(&self, config: &TunnelConfig) -> Result<(), EngineError>;
    async fn disconnect(&self) -> Result<(), EngineError>;
    async fn is_connected(&self) -> bool;
    fn state_stream(&self) -> broadcast::Receiver<EngineUpdate>;
    /// Configuration of the tunnel the engine last brought up
    async fn last_config(&self) -> Option<TunnelConfig>;
}

/// Device connectivity
#[async_trait]
pub trait NetworkObserver: Send + Sync {
    async fn is_connected(&self) -> bool;
    /// `true` on restore, `false` on loss
    fn subscribe(&self) -> broadcast::Receiver<bool>;
}

/// Server catalogue
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn servers(&self) -> Result<Vec<VpnServer>, VpnError>;
    async fn recommended_server(&self) -> Result<Option<VpnServer>, VpnError>;
}

/// Registers this device with the server it connected to
#[async_trait]
pub trait DeviceRegistrar: Send + Sync {
    async fn register_device(&self, server: &VpnServer, protocol: VpnProtocol) -> Result<(), VpnError>;
}

/// Backend-backed server catalogue
pub struct ApiServerDirectory {
    client: ApiClient,
    servers_path: String,
    recommended_path: String,
}

impl ApiServerDirectory {
    pub fn new(
        client: ApiClient,
        servers_path: impl Into<String>,
        recommended_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            servers_path: servers_path.into(),
            recommended_path: recommended_path.into(),
        }
    }
}

#[async_trait]
impl ServerDirectory for ApiServerDirectory {
    async fn servers(&self) -> Result<Vec<VpnServer>, VpnError> {
        Ok(self.client.get_json(&self.servers_path).await?)
    }

    async fn recommended_server(&self) -> Result<Option<VpnServer>, VpnError> {
        match self.client.get_json::<VpnServer>(&self.recommended_path).await {
            Ok(server) => Ok(Some(server)),
            Err(e) if e.status() == Some(404) => {
                debug!("VPN: no recommended server");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Serialize)]
struct RegisterDevice<'a> {
    server_id: &'a str,
    protocol: VpnProtocol,
}

/// Backend-backed device registration
pub struct ApiDeviceRegistrar {
    client: ApiClient,
    path: String,
}

impl ApiDeviceRegistrar {
    pub fn new(client: ApiClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }
}

#[async_trait]
impl DeviceRegistrar for ApiDeviceRegistrar {
    async fn register_device(&self, server: &VpnServer, protocol: VpnProtocol) -> Result<(), VpnError> {
        let body = RegisterDevice {
            server_id: &server.id,
            protocol,
        };
        self.client
            .post_json::<_, serde_json::Value>(&self.path, &body)
            .await?;
        Ok(())
    }
}
