//! Retry Layer
//!
//! Re-issues requests that failed for transient reasons.
//!
//! Retried: connection errors, timeouts, 5xx responses.
//! Never retried: cancelled requests, 4xx, and (unless the policy says
//! otherwise) mutating methods, which could duplicate side effects.
//!
//! Delay before retry `n` (0-based) is `initial_delay * 2^n` plus a
//! random jitter in `[0, initial_delay)`.

use crate::error::ApiError;
use crate::request::{ApiRequest, ApiResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first try
    pub max_retries: u32,
    /// Base delay; doubles per attempt
    pub initial_delay: Duration,
    /// Also retry POST/PUT/PATCH/DELETE
    pub retry_mutating: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            retry_mutating: false,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), jitter included
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_range = self.initial_delay.as_millis() as u64;
        let jitter = if jitter_range == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_range)
        };
        base + Duration::from_millis(jitter)
    }

    /// Decide whether `request` may be retried after `error`
    pub fn should_retry(&self, request: &ApiRequest, error: &ApiError) -> bool {
        if request.attempt >= self.max_retries {
            return false;
        }
        if error.is_cancelled() || request.is_cancelled() {
            return false;
        }
        if request.is_mutating() && !self.retry_mutating {
            return false;
        }
        error.is_transient()
    }
}

/// Retrying transport wrapper
pub struct RetryLayer {
    inner: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryLayer {
    /// Wrap a transport
    pub fn new(inner: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Active policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Transport for RetryLayer {
    async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        loop {
            let error = match self.inner.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if !self.policy.should_retry(&request, &error) {
                if request.attempt > 0 {
                    debug!(
                        "Retry: giving up on {} {} after {} retries: {}",
                        request.method, request.path, request.attempt, error
                    );
                }
                return Err(error);
            }

            let delay = self.policy.delay_for(request.attempt);
            warn!(
                "Retry: {} {} failed ({}), retry {}/{} in {:?}",
                request.method,
                request.path,
                error,
                request.attempt + 1,
                self.policy.max_retries,
                delay
            );

            match request.cancel.clone() {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(ApiError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            request.attempt += 1;
        }
    }
}
