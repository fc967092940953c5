//! Credential Store
//!
//! Durable key-value storage for tokens and small session records.
//! The store is the single source of truth for credentials: only the
//! auth layer (on refresh) and an explicit logout write token keys.
//!
//! Two implementations ship with the crate:
//! - `MemoryCredentialStore` for tests and ephemeral sessions
//! - `FileCredentialStore`, a JSON file rewritten atomically on change
//!
//! Platform keychains plug in by implementing `CredentialStore`.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Storage key for the last connected VPN server (JSON)
pub const LAST_SERVER_KEY: &str = "last_connected_server";
/// Storage key for the last connected VPN protocol
pub const LAST_PROTOCOL_KEY: &str = "last_connected_protocol";

/// Secure key-value storage
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Access/refresh token pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Persist a token pair. A missing refresh token leaves the stored one as is.
pub async fn store_credentials(
    store: &dyn CredentialStore,
    credentials: &Credentials,
) -> Result<(), StoreError> {
    store.write(ACCESS_TOKEN_KEY, &credentials.access_token).await?;
    if let Some(ref refresh) = credentials.refresh_token {
        store.write(REFRESH_TOKEN_KEY, refresh).await?;
    }
    Ok(())
}

/// Delete both tokens
pub async fn purge_credentials(store: &dyn CredentialStore) -> Result<(), StoreError> {
    store.delete(ACCESS_TOKEN_KEY).await?;
    store.delete(REFRESH_TOKEN_KEY).await
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with a token pair
    pub fn with_tokens(access: &str, refresh: &str) -> Self {
        let mut values = HashMap::new();
        values.insert(ACCESS_TOKEN_KEY.to_string(), access.to_string());
        values.insert(REFRESH_TOKEN_KEY.to_string(), refresh.to_string());
        Self {
            values: RwLock::new(values),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// JSON-file backed store
///
/// The whole map is cached in memory and flushed through a temp file +
/// rename on every mutation, so a crash never leaves a torn file.
pub struct FileCredentialStore {
    path: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl FileCredentialStore {
    /// Open (or lazily create) the store at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let values = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        debug!("Credential store opened at {}", path.display());

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    async fn flush(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(values)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.write().await;
        values.insert(key.to_string(), value.to_string());
        self.flush(&values).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.write().await;
        if values.remove(key).is_some() {
            self.flush(&values).await?;
        }
        Ok(())
    }
}
