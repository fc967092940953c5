//! Push events
//!
//! Inbound frames are JSON objects of the form `{"type": ..., "data": {...}}`.
//! Payload fields are parsed leniently; an unknown `type` or a frame that is
//! not a JSON object is rejected and the caller drops it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server availability change
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerStatus {
    pub server_id: String,
    pub status: String,
    pub load: Option<u8>,
}

/// Subscription plan change for the current account
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionUpdate {
    pub plan: Option<String>,
    pub status: String,
    pub expires_at: Option<String>,
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
    pub id: Option<String>,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
struct ForceDisconnectData {
    reason: String,
}

/// Parsed push event
#[derive(Debug, Clone, PartialEq)]
pub enum WebSocketEvent {
    ServerStatusChanged(ServerStatus),
    SubscriptionUpdated(SubscriptionUpdate),
    NotificationReceived(Notification),
    /// The server revoked this session's tunnel
    ForceDisconnect { reason: String },
}

/// Why a frame was dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown event type '{0}'")]
    UnknownType(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl WebSocketEvent {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            WebSocketEvent::ServerStatusChanged(_) => "server_status_changed",
            WebSocketEvent::SubscriptionUpdated(_) => "subscription_updated",
            WebSocketEvent::NotificationReceived(_) => "notification_received",
            WebSocketEvent::ForceDisconnect { .. } => "force_disconnect",
        }
    }

    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        match raw.kind.as_str() {
            "server_status_changed" => payload(raw.data).map(WebSocketEvent::ServerStatusChanged),
            "subscription_updated" => payload(raw.data).map(WebSocketEvent::SubscriptionUpdated),
            "notification_received" => payload(raw.data).map(WebSocketEvent::NotificationReceived),
            "force_disconnect" => payload::<ForceDisconnectData>(raw.data)
                .map(|data| WebSocketEvent::ForceDisconnect { reason: data.reason }),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

fn payload<T: DeserializeOwned + Default>(data: serde_json::Value) -> Result<T, FrameError> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|e| FrameError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_events() {
        let event = WebSocketEvent::parse(
            r#"{"type":"server_status_changed","data":{"server_id":"de-1","status":"maintenance","load":80}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            WebSocketEvent::ServerStatusChanged(ServerStatus {
                server_id: "de-1".into(),
                status: "maintenance".into(),
                load: Some(80),
            })
        );

        let event =
            WebSocketEvent::parse(r#"{"type":"force_disconnect","data":{"reason":"banned"}}"#)
                .unwrap();
        assert_eq!(event, WebSocketEvent::ForceDisconnect { reason: "banned".into() });
        assert_eq!(event.kind(), "force_disconnect");
    }

    #[test]
    fn test_parse_is_lenient_about_payload() {
        let event = WebSocketEvent::parse(
            r#"{"type":"notification_received","data":{"title":"Hi","extra":true}}"#,
        )
        .unwrap();
        match event {
            WebSocketEvent::NotificationReceived(n) => {
                assert_eq!(n.title, "Hi");
                assert_eq!(n.body, "");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let event = WebSocketEvent::parse(r#"{"type":"subscription_updated"}"#).unwrap();
        assert!(matches!(event, WebSocketEvent::SubscriptionUpdated(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert_eq!(
            WebSocketEvent::parse(r#"{"type":"promo","data":{}}"#),
            Err(FrameError::UnknownType("promo".into()))
        );
        assert!(matches!(
            WebSocketEvent::parse("not json"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            WebSocketEvent::parse(r#"{"type":"server_status_changed","data":{"load":"high"}}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_frame_error_messages() {
        assert_eq!(
            FrameError::UnknownType("promo".into()).to_string(),
            "unknown event type 'promo'"
        );
        assert_eq!(
            FrameError::Malformed("eof".into()).to_string(),
            "malformed frame: eof"
        );
    }
}
