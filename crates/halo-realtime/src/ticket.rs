//! Socket tickets
//!
//! The push server authenticates a socket through a short-lived,
//! single-use ticket passed as a query parameter. A provider answering
//! `Ok(None)` means the user is not signed in; the channel then stays
//! disconnected without retrying.

use crate::error::RealtimeError;
use async_trait::async_trait;
use halo_network::{ApiClient, ApiError, ApiRequest};
use serde::Deserialize;
use tracing::debug;

/// Source of single-use socket tickets
#[async_trait]
pub trait TicketProvider: Send + Sync {
    async fn fetch_ticket(&self) -> Result<Option<String>, RealtimeError>;
}

#[derive(Deserialize)]
struct TicketResponse {
    #[serde(default)]
    ticket: Option<String>,
}

/// Fetches tickets from the backend through the resilient client
pub struct ApiTicketProvider {
    client: ApiClient,
    path: String,
}

impl ApiTicketProvider {
    pub fn new(client: ApiClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }
}

#[async_trait]
impl TicketProvider for ApiTicketProvider {
    async fn fetch_ticket(&self) -> Result<Option<String>, RealtimeError> {
        if !self.client.auth().is_authenticated().await {
            debug!("Realtime: not authenticated, no ticket");
            return Ok(None);
        }

        let request = ApiRequest::post(self.path.clone()).bypass_dedup();
        match self.client.send(request).await {
            Ok(response) => {
                let body: TicketResponse = response
                    .json()
                    .map_err(|e| RealtimeError::Ticket(e.to_string()))?;
                Ok(body.ticket.filter(|t| !t.is_empty()))
            }
            Err(e) if signed_out(&e) => {
                debug!("Realtime: ticket refused ({}), treating as signed out", e);
                Ok(None)
            }
            Err(e) => Err(RealtimeError::Ticket(e.to_string())),
        }
    }
}

fn signed_out(error: &ApiError) -> bool {
    error.is_session_expired()
        || error.is_permanent_auth()
        || matches!(error, ApiError::RefreshTokenInvalid)
}
