//! Last-connection record
//!
//! Written after every successful connect, cleared only by an explicit
//! disconnect. Startup recovery and auto-connect read it.

use crate::server::{VpnProtocol, VpnServer};
use halo_network::{CredentialStore, StoreError, LAST_PROTOCOL_KEY, LAST_SERVER_KEY};
use std::sync::Arc;
use tracing::warn;

/// Server and protocol of the last successful connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub server: VpnServer,
    pub protocol: VpnProtocol,
}

/// Stores the record next to the credentials
#[derive(Clone)]
pub struct ConnectionStore {
    store: Arc<dyn CredentialStore>,
}

impl ConnectionStore {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        let server = serde_json::to_string(&record.server)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.write(LAST_SERVER_KEY, &server).await?;
        self.store.write(LAST_PROTOCOL_KEY, record.protocol.as_str()).await
    }

    /// Load the record; an unreadable one counts as absent
    pub async fn load(&self) -> Result<Option<ConnectionRecord>, StoreError> {
        let Some(server) = self.store.read(LAST_SERVER_KEY).await? else {
            return Ok(None);
        };

        let server: VpnServer = match serde_json::from_str(&server) {
            Ok(server) => server,
            Err(e) => {
                warn!("VPN: ignoring unreadable last-server record: {}", e);
                return Ok(None);
            }
        };

        let protocol = match self.store.read(LAST_PROTOCOL_KEY).await? {
            Some(value) => value.parse().unwrap_or_else(|e| {
                warn!("VPN: {}, using server protocol", e);
                server.protocol
            }),
            None => server.protocol,
        };

        Ok(Some(ConnectionRecord { server, protocol }))
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.delete(LAST_SERVER_KEY).await?;
        self.store.delete(LAST_PROTOCOL_KEY).await
    }
}
