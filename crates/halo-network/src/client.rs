//! API client assembly
//!
//! Wires the resilience layers around a transport:
//!
//! ```text
//! caller ─▶ Dedup ─▶ Retry ─▶ Auth ─▶ Transport
//! ```
//!
//! Dedup sits outermost so followers share the whole retried,
//! authenticated outcome. Auth sits innermost so each retry picks up the
//! latest access token.

use crate::auth::{AuthConfig, AuthLayer};
use crate::credentials::CredentialStore;
use crate::dedup::DedupLayer;
use crate::error::ApiError;
use crate::request::{ApiRequest, ApiResponse};
use crate::retry::{RetryLayer, RetryPolicy};
use crate::transport::{HttpTransport, HttpTransportConfig, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Builder for [`ApiClient`]
pub struct ApiClientBuilder {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    retry: RetryPolicy,
    auth: AuthConfig,
}

impl ApiClientBuilder {
    /// Retry policy for transient failures
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Refresh endpoint and backoff
    pub fn auth_config(mut self, config: AuthConfig) -> Self {
        self.auth = config;
        self
    }

    pub fn build(self) -> ApiClient {
        let auth = AuthLayer::new(self.transport, self.store, self.auth);
        let retry = RetryLayer::new(Arc::new(auth.clone()), self.retry);
        let dedup = DedupLayer::new(Arc::new(retry));

        ApiClient {
            chain: Arc::new(dedup),
            auth,
        }
    }
}

/// Resilient backend client
#[derive(Clone)]
pub struct ApiClient {
    chain: Arc<dyn Transport>,
    auth: AuthLayer,
}

impl ApiClient {
    /// Start from an arbitrary transport
    pub fn builder(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> ApiClientBuilder {
        ApiClientBuilder {
            transport,
            store,
            retry: RetryPolicy::default(),
            auth: AuthConfig::default(),
        }
    }

    /// Start from the HTTPS transport
    pub fn http(config: HttpTransportConfig, store: Arc<dyn CredentialStore>) -> ApiClientBuilder {
        Self::builder(Arc::new(HttpTransport::new(config)), store)
    }

    /// Auth layer handle (events, logout, credential updates)
    pub fn auth(&self) -> &AuthLayer {
        &self.auth
    }

    /// Send through the full chain
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.chain.send(request).await
    }

    /// GET and decode a JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    /// POST a JSON body and decode the JSON reply
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::post(path).json(body)?).await?.json()
    }
}

#[async_trait::async_trait]
impl Transport for ApiClient {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.chain.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::testing::{ok, status, ScriptedTransport};
    use futures_util::future::join_all;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Servers {
        count: u32,
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_collapses_reads_and_refreshes_once() {
        let transport = Arc::new(
            ScriptedTransport::new(|request, n| match request.path.as_str() {
                "/auth/refresh" => ok(serde_json::json!({ "access_token": "a2" })),
                "/servers" if n == 0 => Err(status(401)),
                "/servers" => ok(serde_json::json!({ "count": 12 })),
                _ => Err(status(404)),
            })
            .with_delay(Duration::from_millis(25)),
        );
        let store = Arc::new(MemoryCredentialStore::with_tokens("a1", "r1"));
        let client = ApiClient::builder(transport.clone(), store).build();

        let results = join_all((0..4).map(|_| client.get_json::<Servers>("/servers"))).await;

        for result in results {
            assert_eq!(result.unwrap(), Servers { count: 12 });
        }
        assert_eq!(transport.calls_to("/servers"), 2);
        assert_eq!(transport.calls_to("/auth/refresh"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_retries_transient_failures() {
        let transport = Arc::new(ScriptedTransport::new(|_, n| {
            if n == 0 {
                Err(status(502))
            } else {
                ok(serde_json::json!({ "count": 3 }))
            }
        }));
        let store = Arc::new(MemoryCredentialStore::with_tokens("a1", "r1"));
        let client = ApiClient::builder(transport.clone(), store).build();

        let servers: Servers = client.get_json("/servers").await.unwrap();

        assert_eq!(servers.count, 3);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_refresh_is_not_retried_by_the_chain() {
        let transport = Arc::new(ScriptedTransport::new(|request, _| {
            match request.path.as_str() {
                "/auth/refresh" => Err(ApiError::Timeout),
                _ => Err(status(401)),
            }
        }));
        let store = Arc::new(MemoryCredentialStore::with_tokens("a1", "r1"));
        let client = ApiClient::builder(transport.clone(), store).build();

        let err = client.send(ApiRequest::get("/servers")).await.unwrap_err();

        assert_eq!(err, ApiError::RefreshUnavailable(Box::new(ApiError::Timeout)));
        assert_eq!(transport.calls_to("/auth/refresh"), 3);
        assert_eq!(transport.calls_to("/servers"), 1);
    }

    #[tokio::test]
    async fn test_post_json_is_sent_once_on_failure() {
        let transport = Arc::new(ScriptedTransport::new(|_, _| Err(status(500))));
        let store = Arc::new(MemoryCredentialStore::with_tokens("a1", "r1"));
        let client = ApiClient::builder(transport.clone(), store).build();

        let result: Result<serde_json::Value, _> =
            client.post_json("/devices", &serde_json::json!({ "id": 1 })).await;

        assert_eq!(result.unwrap_err().status(), Some(500));
        assert_eq!(transport.calls(), 1);
    }
}
