//! Scripted transport for pipeline tests.

use crate::error::ApiError;
use crate::request::{ApiRequest, ApiResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

type Handler = dyn Fn(&ApiRequest, usize) -> Result<ApiResponse, ApiError> + Send + Sync;

/// Records every request and answers through a closure.
///
/// The closure receives the request and the 0-based index of that call
/// among calls to the same path.
pub(crate) struct ScriptedTransport {
    log: Mutex<Vec<ApiRequest>>,
    handler: Box<Handler>,
    delay: Duration,
}

impl ScriptedTransport {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest, usize) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    {
        Self {
            log: Mutex::new(Vec::new()),
            handler: Box::new(handler),
            delay: Duration::ZERO,
        }
    }

    /// Hold every response for `delay` before answering
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub(crate) fn calls_to(&self, path: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|r| r.path == path).count()
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let index = {
            let mut log = self.log.lock().unwrap();
            let index = log.iter().filter(|r| r.path == request.path).count();
            log.push(request.clone());
            index
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if request.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        (self.handler)(&request, index)
    }
}

pub(crate) fn status(code: u16) -> ApiError {
    ApiError::Status {
        status: code,
        message: format!("status {}", code),
    }
}

pub(crate) fn ok(body: serde_json::Value) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::ok_json(&body))
}
