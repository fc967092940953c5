//! Auth Layer
//!
//! Attaches the bearer token to every request and recovers from expired
//! access tokens with a single-flight refresh.
//!
//! # Refresh protocol
//!
//! ```text
//!   401 ──▶ Idle? ──yes──▶ Refreshing ──▶ POST refresh ──▶ replay original
//!             │                                               │
//!             no                                              ▼
//!             └──▶ queue ◀──────────── drain ◀──────── replay each waiter
//! ```
//!
//! - Exactly one refresh call per burst of 401s
//! - The original request is replayed and resolved before any waiter
//! - 401/403 on the refresh call purges both tokens and fails everyone
//!   with the same `SessionExpired` error
//! - Transient refresh failures are retried twice (500 ms, 1000 ms) and
//!   then surface as `RefreshUnavailable` without touching the stored
//!   tokens, so outer retry layers do not start another refresh
//! - A queued caller whose request is cancelled leaves with `Cancelled`
//! - The cycle runs on its own task, so a caller dropping its future
//!   cannot strand the queue; every exit path returns to `Idle`

use crate::credentials::{
    purge_credentials, store_credentials, CredentialStore, Credentials, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};
use crate::error::ApiError;
use crate::request::{ApiRequest, ApiResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use hyper::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Auth layer configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Refresh endpoint path
    pub refresh_path: String,
    /// Fixed delays between refresh attempts; its length is the number
    /// of extra attempts
    pub refresh_backoff: Vec<Duration>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: "/auth/refresh".to_string(),
            refresh_backoff: vec![Duration::from_millis(500), Duration::from_millis(1000)],
        }
    }
}

/// Session lifecycle notifications for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// New tokens were stored after a refresh
    TokensRefreshed,
    /// The session is gone; the user has to log in again
    SessionExpired { reason: String },
    /// Tokens were removed by an explicit logout
    LoggedOut,
}

/// Refresh state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// A request parked behind an in-flight refresh
struct Waiter {
    request: ApiRequest,
    failure: ApiError,
    done: oneshot::Sender<Result<ApiResponse, ApiError>>,
}

struct AuthState {
    refresh: RefreshState,
    waiters: Vec<Waiter>,
}

struct AuthInner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    config: AuthConfig,
    state: Mutex<AuthState>,
    events: broadcast::Sender<AuthEvent>,
}

/// Authenticating transport wrapper
#[derive(Clone)]
pub struct AuthLayer {
    inner: Arc<AuthInner>,
}

impl AuthLayer {
    /// Wrap a transport
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        config: AuthConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(AuthInner {
                transport,
                store,
                config,
                state: Mutex::new(AuthState {
                    refresh: RefreshState::Idle,
                    waiters: Vec::new(),
                }),
                events,
            }),
        }
    }

    /// Subscribe to session events
    pub fn events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// Current refresh state
    pub fn refresh_state(&self) -> RefreshState {
        self.inner.lock_state().refresh
    }

    /// Check if an access token is stored
    pub async fn is_authenticated(&self) -> bool {
        matches!(self.inner.store.read(ACCESS_TOKEN_KEY).await, Ok(Some(_)))
    }

    /// Store tokens obtained from a login flow
    pub async fn set_credentials(&self, credentials: &Credentials) -> Result<(), ApiError> {
        store_credentials(&*self.inner.store, credentials).await?;
        Ok(())
    }

    /// Remove both tokens and notify listeners
    pub async fn logout(&self) -> Result<(), ApiError> {
        purge_credentials(&*self.inner.store).await?;
        info!("Auth: logged out, credentials purged");
        let _ = self.inner.events.send(AuthEvent::LoggedOut);
        Ok(())
    }
}

#[async_trait]
impl Transport for AuthLayer {
    async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if !request.is_refresh {
            if let Some(token) = self.inner.store.read(ACCESS_TOKEN_KEY).await? {
                request.set_bearer(&token)?;
            }
        }

        match self.inner.transport.send(request.clone()).await {
            Err(failure) if failure.is_unauthorized() => {
                self.inner.clone().handle_unauthorized(request, failure).await
            }
            other => other,
        }
    }
}

impl AuthInner {
    fn lock_state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_unauthorized(
        self: Arc<Self>,
        request: ApiRequest,
        failure: ApiError,
    ) -> Result<ApiResponse, ApiError> {
        if request.is_refresh {
            warn!("Auth: refresh call rejected with 401, not refreshing again");
            return Err(ApiError::RefreshTokenInvalid);
        }

        // Sent with a token that has since been rotated: just replay
        if let Some(current) = self.store.read(ACCESS_TOKEN_KEY).await? {
            if sent_token(&request).as_deref() != Some(current.as_str()) {
                debug!("Auth: token rotated since {} was sent, replaying", request.path);
                return self.replay(request, &current).await;
            }
        }

        debug!("Auth: {} returned 401 ({})", request.path, failure);
        let cancel = request.cancel.clone();
        let claimed = {
            let mut state = self.lock_state();
            match state.refresh {
                RefreshState::Refreshing => {
                    let (done, rx) = oneshot::channel();
                    state.waiters.push(Waiter {
                        request,
                        failure,
                        done,
                    });
                    Err(rx)
                }
                RefreshState::Idle => {
                    state.refresh = RefreshState::Refreshing;
                    Ok(request)
                }
            }
        };

        let request = match claimed {
            Ok(request) => request,
            Err(rx) => {
                debug!("Auth: refresh in flight, request queued");
                let queued = async { rx.await.unwrap_or(Err(ApiError::Cancelled)) };
                return match cancel {
                    Some(token) => tokio::select! {
                        _ = token.cancelled() => Err(ApiError::Cancelled),
                        outcome = queued => outcome,
                    },
                    None => queued.await,
                };
            }
        };

        debug!("Auth: refreshing tokens for {}", request.path);
        let cycle = tokio::spawn(self.clone().refresh_cycle(request));
        match cycle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Auth: refresh task failed: {}", e);
                Err(ApiError::Cancelled)
            }
        }
    }

    /// Refresh, replay the original, then drain the queue
    async fn refresh_cycle(self: Arc<Self>, original: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut guard = CycleGuard {
            inner: self.clone(),
            done: false,
        };

        match self.refresh_tokens().await {
            Ok(access) => {
                let outcome = self.replay(original, &access).await;

                let waiters = guard.finish();
                if !waiters.is_empty() {
                    debug!("Auth: replaying {} queued request(s)", waiters.len());
                }
                for waiter in waiters {
                    if waiter.request.is_cancelled() {
                        let _ = waiter.done.send(Err(ApiError::Cancelled));
                        continue;
                    }
                    let inner = self.clone();
                    let access = access.clone();
                    tokio::spawn(async move {
                        let result = inner.replay(waiter.request, &access).await;
                        let _ = waiter.done.send(result);
                    });
                }

                let _ = self.events.send(AuthEvent::TokensRefreshed);
                outcome
            }
            Err(error) => {
                let waiters = guard.finish();
                for waiter in waiters {
                    debug!(
                        "Auth: failing queued {} ({}) with {}",
                        waiter.request.path, waiter.failure, error
                    );
                    let _ = waiter.done.send(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    /// Call the refresh endpoint; returns the new access token
    async fn refresh_tokens(&self) -> Result<String, ApiError> {
        let Some(refresh_token) = self.store.read(REFRESH_TOKEN_KEY).await? else {
            warn!("Auth: no refresh token available");
            return Err(self.expire("No refresh token available"));
        };

        let mut attempt = 0;
        loop {
            let request = ApiRequest::post(self.config.refresh_path.clone())
                .json(&RefreshRequest {
                    refresh_token: &refresh_token,
                })?
                .refresh_call();

            match self.transport.send(request).await {
                Ok(response) => {
                    let body: RefreshResponse = response.json()?;
                    store_credentials(
                        &*self.store,
                        &Credentials {
                            access_token: body.access_token.clone(),
                            refresh_token: body.refresh_token,
                        },
                    )
                    .await?;
                    info!("Auth: tokens refreshed");
                    return Ok(body.access_token);
                }
                Err(e) if e.is_permanent_auth() => {
                    warn!("Auth: refresh rejected ({}), purging credentials", e);
                    if let Err(store_err) = purge_credentials(&*self.store).await {
                        error!("Auth: failed to purge credentials: {}", store_err);
                    }
                    return Err(self.expire("Refresh token rejected"));
                }
                Err(e) if e.is_refresh_transient() && attempt < self.config.refresh_backoff.len() => {
                    let delay = self.config.refresh_backoff[attempt];
                    attempt += 1;
                    warn!(
                        "Auth: refresh failed ({}), attempt {}/{} in {:?}",
                        e,
                        attempt,
                        self.config.refresh_backoff.len(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    warn!("Auth: refresh unavailable: {}", e);
                    return Err(ApiError::RefreshUnavailable(Box::new(e)));
                }
                Err(e) => {
                    warn!("Auth: refresh failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn replay(&self, mut request: ApiRequest, access: &str) -> Result<ApiResponse, ApiError> {
        request.set_bearer(access)?;
        self.transport.send(request).await
    }

    fn expire(&self, reason: &str) -> ApiError {
        let _ = self.events.send(AuthEvent::SessionExpired {
            reason: reason.to_string(),
        });
        ApiError::SessionExpired(reason.to_string())
    }
}

/// Returns the layer to `Idle`; if the cycle dies early, queued callers
/// are failed as cancelled.
struct CycleGuard {
    inner: Arc<AuthInner>,
    done: bool,
}

impl CycleGuard {
    fn finish(&mut self) -> Vec<Waiter> {
        self.done = true;
        let mut state = self.inner.lock_state();
        state.refresh = RefreshState::Idle;
        std::mem::take(&mut state.waiters)
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.done {
            for waiter in self.finish() {
                let _ = waiter.done.send(Err(ApiError::Cancelled));
            }
        }
    }
}

fn sent_token(request: &ApiRequest) -> Option<String> {
    request
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}
