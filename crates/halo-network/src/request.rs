//! Request and response model shared by every pipeline layer.

use crate::error::ApiError;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Outbound API request
///
/// Paths are relative to the transport's base URL. The flags are
/// pipeline metadata and never go on the wire.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Path relative to the API base URL
    pub path: String,
    /// Query parameters in insertion order
    pub query: Vec<(String, String)>,
    /// Extra request headers
    pub headers: HeaderMap,
    /// Request body (JSON)
    pub body: Option<Bytes>,
    /// Retry attempt counter (0 = first try)
    pub attempt: u32,
    /// Force a fresh network call even if an identical read is in flight
    pub bypass_dedup: bool,
    /// Marks the token refresh call so the auth layer never recurses on it
    pub is_refresh: bool,
    /// Caller-side cancellation
    pub cancel: Option<CancellationToken>,
}

impl ApiRequest {
    /// Create a request with the given method and path
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            attempt: 0,
            bypass_dedup: false,
            is_refresh: false,
            cancel: None,
        }
    }

    /// GET request
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST request
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// PUT request
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// DELETE request
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Append a query parameter
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Serialize `body` as the JSON request body
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// Skip deduplication for this call (e.g. pull-to-refresh)
    pub fn bypass_dedup(mut self) -> Self {
        self.bypass_dedup = true;
        self
    }

    /// Flag this request as the token refresh call
    pub fn refresh_call(mut self) -> Self {
        self.is_refresh = true;
        self
    }

    /// Attach a cancellation token
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Set the bearer token, replacing any previous one
    pub fn set_bearer(&mut self, token: &str) -> Result<(), ApiError> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    /// GET and HEAD are safe to collapse and replay
    pub fn is_idempotent_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// POST, PUT, PATCH and DELETE have server-side effects
    pub fn is_mutating(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }

    /// Check whether the caller already cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Deterministic key: method, path and query sorted by key then value
    pub fn dedup_key(&self) -> String {
        let mut params: Vec<&(String, String)> = self.query.iter().collect();
        params.sort();

        let mut key = format!("{} {}", self.method, self.path);
        for (i, (k, v)) in params.iter().enumerate() {
            key.push(if i == 0 { '?' } else { '&' });
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}

/// API response
///
/// Cheap to clone: the body is reference counted.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl ApiResponse {
    /// Create a response
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// 200 OK with a JSON body
    pub fn ok_json(value: &serde_json::Value) -> Self {
        Self::new(StatusCode::OK, value.to_string())
    }

    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Get body as string
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_ignores_param_order() {
        let a = ApiRequest::get("/servers").query("region", "de").query("page", "2");
        let b = ApiRequest::get("/servers").query("page", "2").query("region", "de");

        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), "GET /servers?page=2&region=de");
    }

    #[test]
    fn test_dedup_key_distinguishes_method_and_values() {
        let get = ApiRequest::get("/servers").query("page", "1");
        let head = ApiRequest::new(Method::HEAD, "/servers").query("page", "1");
        let other = ApiRequest::get("/servers").query("page", "2");

        assert_ne!(get.dedup_key(), head.dedup_key());
        assert_ne!(get.dedup_key(), other.dedup_key());
        assert_eq!(ApiRequest::get("/me").dedup_key(), "GET /me");
    }

    #[test]
    fn test_method_classification() {
        assert!(ApiRequest::get("/a").is_idempotent_read());
        assert!(!ApiRequest::get("/a").is_mutating());
        assert!(ApiRequest::post("/a").is_mutating());
        assert!(ApiRequest::delete("/a").is_mutating());
        assert!(!ApiRequest::put("/a").is_idempotent_read());
    }

    #[test]
    fn test_bearer_and_json() {
        let mut request = ApiRequest::post("/auth/refresh")
            .json(&serde_json::json!({ "refresh_token": "r1" }))
            .unwrap();
        request.set_bearer("abc").unwrap();

        assert_eq!(request.headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(request.body.is_some());
    }

    #[test]
    fn test_cancel_flag() {
        let token = CancellationToken::new();
        let request = ApiRequest::get("/a").with_cancel(token.clone());
        assert!(!request.is_cancelled());
        token.cancel();
        assert!(request.is_cancelled());
    }

    #[test]
    fn test_response_json() {
        let response = ApiResponse::ok_json(&serde_json::json!({ "ticket": "t-1" }));
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ticket"], "t-1");
        assert!(response.is_success());
    }
}
