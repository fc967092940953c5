//! Request Deduplication
//!
//! Collapses concurrent identical idempotent reads into one network call.
//!
//! # Behavior
//!
//! - Only GET/HEAD are considered; mutating calls pass straight through
//! - The first caller for a key (the leader) performs the call
//! - Later callers with the same key (followers) await the leader's outcome
//! - The registration is removed the moment the leader settles, so the
//!   sharing window never exceeds one round trip
//! - If the leader is dropped mid-flight, followers get `ApiError::Cancelled`
//!
//! Keys come from `ApiRequest::dedup_key`, so query parameter order does
//! not matter.

use crate::error::ApiError;
use crate::request::{ApiRequest, ApiResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

type Outcome = Result<ApiResponse, ApiError>;
type PendingMap = HashMap<String, Vec<oneshot::Sender<Outcome>>>;

/// Deduplicating transport wrapper
pub struct DedupLayer {
    inner: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingMap>>,
}

impl DedupLayer {
    /// Wrap a transport
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys with a call in flight
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    fn should_dedup(request: &ApiRequest) -> bool {
        request.is_idempotent_read() && !request.bypass_dedup && !request.is_cancelled()
    }
}

#[async_trait]
impl Transport for DedupLayer {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if !Self::should_dedup(&request) {
            return self.inner.send(request).await;
        }

        let key = request.dedup_key();

        let follower = {
            let mut pending = lock(&self.pending);
            match pending.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    pending.insert(key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = follower {
            debug!("Dedup: joining in-flight {}", key);
            let shared = async { rx.await.unwrap_or(Err(ApiError::Cancelled)) };
            return match request.cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => Err(ApiError::Cancelled),
                    outcome = shared => outcome,
                },
                None => shared.await,
            };
        }

        let registration = Registration {
            pending: self.pending.clone(),
            key: Some(key),
        };
        let outcome = self.inner.send(request).await;
        registration.settle(&outcome);
        outcome
    }
}

/// Leader's claim on a key. Settling fans the outcome out; dropping
/// without settling unregisters the key and fails followers as cancelled.
struct Registration {
    pending: Arc<Mutex<PendingMap>>,
    key: Option<String>,
}

impl Registration {
    fn settle(mut self, outcome: &Outcome) {
        let waiters = self.take();
        if !waiters.is_empty() {
            debug!("Dedup: delivering outcome to {} waiter(s)", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn take(&mut self) -> Vec<oneshot::Sender<Outcome>> {
        match self.key.take() {
            Some(key) => lock(&self.pending).remove(&key).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Dropped senders surface as `Cancelled` on the follower side
        drop(self.take());
    }
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
