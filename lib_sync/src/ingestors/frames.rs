//! # Push Channel Frames
//!
//! JSON text frames exchanged over the push socket. Every frame carries a
//! `type` tag; the remaining envelope fields (`channel`, `resource`, `event`,
//! `data`, `timestamp`, `id`) are optional and only meaningful for some types.
//!
//! Client to server: `subscribe`, `unsubscribe`, `heartbeat`, `auth`, `pong`.
//! Server to client: `notification`, `heartbeat`/`pong` (acks), `ping`,
//! `error`, `connected`, `subscribed`, `unsubscribed`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::registry::Subscription;
use crate::error::SyncError;

/// One frame on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Ask the server to start pushing a channel.
    Subscribe {
        /// Channel key.
        resource: String,
        /// Filters, if the subscription carries any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Ask the server to stop pushing a channel.
    Unsubscribe {
        /// Channel key.
        resource: String,
    },

    /// Server liveness check. Answered with `pong`.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Heartbeat acknowledgement, or the answer to a server `ping`.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Sent by the client on its heartbeat interval; echoed by the server as an ack.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// A change to a server-side resource.
    Notification {
        /// `type` or `type:id`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
        /// Alternative to `resource` used by some producers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        /// Event name, e.g. `updated`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        /// Payload.
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        /// Explicit record id, overriding the one found in `resource` or `data`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Credentials, sent right after the socket opens.
    Auth {
        /// Opaque credential payload.
        data: Value,
    },

    /// Server-side failure report.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Handshake completion.
    Connected {
        #[serde(
            default,
            rename = "connectionId",
            skip_serializing_if = "Option::is_none"
        )]
        connection_id: Option<String>,
    },

    /// Subscription acknowledgement.
    Subscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
    },

    /// Unsubscription acknowledgement.
    Unsubscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
    },
}

impl Frame {
    /// `subscribe` frame for a registry entry.
    pub fn subscribe(key: &str, subscription: &Subscription) -> Self {
        let data = if subscription.filters.is_empty() {
            None
        } else {
            serde_json::to_value(&subscription.filters).ok()
        };
        Frame::Subscribe {
            resource: key.to_string(),
            data,
        }
    }

    /// `unsubscribe` frame for a registry key.
    pub fn unsubscribe(key: &str) -> Self {
        Frame::Unsubscribe {
            resource: key.to_string(),
        }
    }

    /// `heartbeat` frame stamped with `now_ms`.
    pub fn heartbeat(now_ms: u64) -> Self {
        Frame::Heartbeat {
            timestamp: Some(now_ms as i64),
        }
    }

    /// `auth` frame carrying a bearer token.
    pub fn auth(token: &str) -> Self {
        Frame::Auth {
            data: serde_json::json!({ "token": token }),
        }
    }

    /// Serializes the frame to its wire text.
    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Parse(e.to_string()))
    }

    /// Parses wire text. Unknown `type`s and malformed JSON are `Parse` errors.
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Parse(e.to_string()))
    }
}

/// What a notification asks the consumer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A record was added.
    Create,
    /// Fields of a record changed.
    Update,
    /// A record was removed.
    Delete,
    /// The whole resource value is in the payload.
    Replace,
    /// An event name with no known mapping.
    Unknown(String),
}

impl Action {
    /// Maps a server event name onto an action.
    pub fn from_event(event: &str) -> Self {
        match event.to_ascii_lowercase().as_str() {
            "create" | "created" | "insert" | "inserted" => Action::Create,
            "update" | "updated" | "patch" | "patched" => Action::Update,
            "delete" | "deleted" | "remove" | "removed" => Action::Delete,
            "replace" | "replaced" | "snapshot" | "bulk" | "refresh" => Action::Replace,
            _ => Action::Unknown(event.to_string()),
        }
    }
}

/// A decoded notification, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    /// Resource type, e.g. `orders`.
    pub resource_type: String,
    /// Record id, when identifiable.
    pub resource_id: Option<String>,
    /// Normalised action.
    pub action: Action,
    /// Raw event name as sent by the server.
    pub event: String,
    /// Payload.
    pub data: Value,
    /// Server timestamp, if sent.
    pub timestamp: Option<i64>,
}

impl NotificationMessage {
    /// Builds a message from a `notification` frame. Other frame types yield `None`.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, SyncError> {
        let Frame::Notification {
            resource,
            channel,
            event,
            data,
            timestamp,
            id,
        } = frame
        else {
            return Ok(None);
        };

        let target = resource
            .as_deref()
            .or(channel.as_deref())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::Parse("notification without resource".to_string()))?;

        let (resource_type, id_in_target) = match target.split_once(':') {
            Some((t, rest)) if !rest.is_empty() => (t.to_string(), Some(rest.to_string())),
            Some((t, _)) => (t.to_string(), None),
            None => (target.to_string(), None),
        };

        let resource_id = id.clone().or(id_in_target).or_else(|| id_of(data));
        let event = event.clone().unwrap_or_default();

        Ok(Some(NotificationMessage {
            resource_type,
            resource_id,
            action: Action::from_event(&event),
            event,
            data: data.clone(),
            timestamp: *timestamp,
        }))
    }
}

/// Reads `data.id` as a string if it is a string or number.
pub fn id_of(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_with_numeric_id_in_data() {
        let frame = Frame::decode(
            r#"{"type":"notification","resource":"orders","event":"updated","data":{"id":5}}"#,
        )
        .unwrap();
        let msg = NotificationMessage::from_frame(&frame).unwrap().unwrap();

        assert_eq!(msg.resource_type, "orders");
        assert_eq!(msg.resource_id.as_deref(), Some("5"));
        assert_eq!(msg.action, Action::Update);
        assert_eq!(msg.event, "updated");
    }

    #[test]
    fn resource_may_carry_the_id() {
        let frame = Frame::decode(
            r#"{"type":"notification","channel":"users:abc","event":"deleted","data":null}"#,
        )
        .unwrap();
        let msg = NotificationMessage::from_frame(&frame).unwrap().unwrap();
        assert_eq!(msg.resource_type, "users");
        assert_eq!(msg.resource_id.as_deref(), Some("abc"));
        assert_eq!(msg.action, Action::Delete);
    }

    #[test]
    fn unknown_type_and_bad_json_are_parse_errors() {
        assert!(matches!(
            Frame::decode(r#"{"type":"teleport"}"#),
            Err(SyncError::Parse(_))
        ));
        assert!(matches!(Frame::decode("{not json"), Err(SyncError::Parse(_))));
    }

    #[test]
    fn notification_without_target_is_rejected() {
        let frame = Frame::decode(r#"{"type":"notification","event":"created"}"#).unwrap();
        assert!(NotificationMessage::from_frame(&frame).is_err());
    }

    #[test]
    fn outbound_frames_have_wire_shape() {
        let sub = Subscription::new("orders").with_filter("status", "open");
        let text = Frame::subscribe(&sub.key(), &sub).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "subscribe", "resource": "orders?status=open", "data": {"status": "open"}})
        );

        let hb: Value = serde_json::from_str(&Frame::heartbeat(42).encode().unwrap()).unwrap();
        assert_eq!(hb, json!({"type": "heartbeat", "timestamp": 42}));

        let connected = Frame::decode(r#"{"type":"connected","connectionId":"c-1"}"#).unwrap();
        assert_eq!(
            connected,
            Frame::Connected {
                connection_id: Some("c-1".into())
            }
        );
    }

    #[test]
    fn event_names_map_to_actions() {
        assert_eq!(Action::from_event("Created"), Action::Create);
        assert_eq!(Action::from_event("snapshot"), Action::Replace);
        assert_eq!(
            Action::from_event("archived"),
            Action::Unknown("archived".into())
        );
    }
}
