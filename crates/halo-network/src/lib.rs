//! Halo Network Layer
//!
//! Resilient backend API access for the VPN client.
//!
//! Architecture:
//! 1. Request enters the dedup layer → identical in-flight reads share one call
//! 2. Retry layer → transient failures re-issued with exponential backoff
//! 3. Auth layer → bearer token attached, 401s recovered by one refresh
//! 4. Transport → hyper + rustls over tokio

mod auth;
mod client;
mod credentials;
mod dedup;
mod error;
mod request;
mod retry;
mod transport;

#[cfg(test)]
mod testing;

pub use auth::{AuthConfig, AuthEvent, AuthLayer, RefreshState};
pub use client::{ApiClient, ApiClientBuilder};
pub use credentials::{
    purge_credentials, store_credentials, CredentialStore, Credentials, FileCredentialStore,
    MemoryCredentialStore, ACCESS_TOKEN_KEY, LAST_PROTOCOL_KEY, LAST_SERVER_KEY,
    REFRESH_TOKEN_KEY,
};
pub use dedup::DedupLayer;
pub use error::{ApiError, StoreError};
pub use request::{ApiRequest, ApiResponse};
pub use retry::{RetryLayer, RetryPolicy};
pub use transport::{HttpTransport, HttpTransportConfig, Transport};

pub use hyper::{Method, StatusCode};
pub use tokio_util::sync::CancellationToken;
pub use url::Url;
