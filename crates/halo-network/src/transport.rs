//! HTTP Transport
//!
//! Uses hyper with tokio for async HTTP/1.1 against the backend API.
//! Features:
//! - Automatic HTTPS with rustls (memory-safe TLS)
//! - Separate connect and whole-request timeouts
//! - Cancellation through the request's token
//! - Non-2xx responses surfaced as `ApiError::Status`
//!
//! The `Transport` trait is the seam every pipeline layer wraps, so
//! tests substitute scripted fakes for the network.

use crate::error::ApiError;
use crate::request::{ApiRequest, ApiResponse};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Request, Response, StatusCode};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

/// Performs one request/response exchange
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        (**self).send(request).await
    }
}

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// API base URL, e.g. `https://api.example.com/v1`
    pub base_url: Url,
    /// Whole-request timeout
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl HttpTransportConfig {
    /// Create a configuration with default timeouts
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("halo-client/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

/// hyper + rustls transport
pub struct HttpTransport {
    config: HttpTransportConfig,
    tls: TlsConnector,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(config: HttpTransportConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        info!(
            "HTTP transport initialized (base: {}, timeout: {:?})",
            config.base_url, config.timeout
        );

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Join the base URL, request path and query parameters
    pub fn resolve_url(&self, request: &ApiRequest) -> Result<Url, ApiError> {
        let base = self.config.base_url.as_str().trim_end_matches('/');
        let path = request.path.trim_start_matches('/');

        let mut url = Url::parse(&format!("{}/{}", base, path))
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }

    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let start = Instant::now();

        // 1. Resolve URL
        let url = self.resolve_url(&request)?;
        let host = url
            .host_str()
            .ok_or_else(|| ApiError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let is_https = url.scheme() == "https";
        let port = url
            .port_or_known_default()
            .unwrap_or(if is_https { 443 } else { 80 });

        // 2. Build request
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(&url[url::Position::BeforePath..])
            .header(HOST, host.as_str())
            .header(USER_AGENT, self.config.user_agent.as_str());

        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
            if request.body.is_some() && !headers.contains_key(CONTENT_TYPE) {
                headers.insert(
                    CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("application/json"),
                );
            }
        }

        let http_request = builder
            .body(Full::new(request.body.clone().unwrap_or_default()))
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        // 3. Connect
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ApiError::Timeout)?
            .map_err(|e| ApiError::Connection(e.to_string()))?;

        let response = if is_https {
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| ApiError::Tls("Invalid server name".to_string()))?;

            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| ApiError::Tls(e.to_string()))?;

            send_over(tls_stream, http_request).await?
        } else {
            send_over(stream, http_request).await?
        };

        // 4. Read response
        let status = response.status();
        let headers = response.headers().clone();
        let body = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?
            .to_bytes();

        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?})",
            request.method,
            request.path,
            status,
            body.len(),
            start.elapsed()
        );

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let cancel = request.cancel.clone();
        let work = tokio::time::timeout(self.config.timeout, self.execute(request));

        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(ApiError::Cancelled),
                    result = work => result.unwrap_or_else(|_| Err(ApiError::Timeout)),
                }
            }
            None => work.await.unwrap_or_else(|_| Err(ApiError::Timeout)),
        }
    }
}

async fn send_over<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, ApiError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ApiError::Connection(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| ApiError::Connection(e.to_string()))
}

/// Pull a human-readable message out of an error body
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for field in ["message", "error", "detail"] {
            if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        status.canonical_reason().unwrap_or("Unknown status").to_string()
    } else {
        text.chars().take(200).collect()
    }
}
