//! Outbound message types handed to an [`crate::encoders::Encoder`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PingPrecision;

/// Generic server → client reply.
///
/// Broadcasts carry no `type`; protocol replies (`welcome`,
/// `confirm_history`, ...) do. When the message came out of a broker with
/// history, `stream_id`, `epoch` and `offset` form the resume cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Reply type; empty for plain broadcasts.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub reply_type: String,
    /// Channel identifier the reply belongs to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identifier: String,
    /// Payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub message: Value,
    /// Session id (welcome replies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Whether the session was restored (welcome replies).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restored: bool,
    /// Stream the message was published on.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream_id: String,
    /// Broker generation of `offset`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    /// Position of the message in its stream.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
}

impl Reply {
    /// Builds a typed protocol reply for `identifier`.
    #[must_use]
    pub fn typed(reply_type: &str, identifier: &str) -> Self {
        Self {
            reply_type: reply_type.to_string(),
            identifier: identifier.to_string(),
            ..Self::default()
        }
    }

    /// Builds a broadcast reply; `data` is embedded as JSON when it parses,
    /// otherwise as a JSON string.
    #[must_use]
    pub fn broadcast(identifier: &str, data: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            message: embed(data),
            ..Self::default()
        }
    }

    /// Attaches a resume cursor.
    #[must_use]
    pub fn with_position(mut self, stream: &str, epoch: &str, offset: u64) -> Self {
        self.stream_id = stream.to_string();
        self.epoch = epoch.to_string();
        self.offset = offset;
        self
    }

    /// Returns `true` when the reply carries a usable resume cursor.
    #[must_use]
    pub fn has_position(&self) -> bool {
        self.offset > 0 && !self.epoch.is_empty() && !self.stream_id.is_empty()
    }
}

/// Keepalive frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingMessage {
    /// Always `"ping"`.
    #[serde(rename = "type")]
    pub message_type: &'static str,
    /// Current Unix time at the configured precision.
    pub message: i64,
}

impl PingMessage {
    /// Builds a ping stamped with the current time.
    #[must_use]
    pub fn now(precision: PingPrecision) -> Self {
        let now = chrono::Utc::now();
        let message = match precision {
            PingPrecision::Seconds => now.timestamp(),
            PingPrecision::Millis => now.timestamp_millis(),
            PingPrecision::Nanos => now.timestamp_nanos_opt().unwrap_or(i64::MAX),
        };
        Self {
            message_type: "ping",
            message,
        }
    }
}

/// Sent right before a server-initiated close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectMessage {
    /// Always `"disconnect"`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Human-readable reason.
    pub reason: String,
    /// Whether the client should reconnect.
    pub reconnect: bool,
}

impl DisconnectMessage {
    /// Builds a disconnect notice.
    #[must_use]
    pub fn new(reason: &str, reconnect: bool) -> Self {
        Self {
            message_type: "disconnect".to_string(),
            reason: reason.to_string(),
            reconnect,
        }
    }
}

/// Any typed message a session can send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    /// Reply or broadcast.
    Reply(Reply),
    /// Keepalive.
    Ping(PingMessage),
    /// Disconnect notice.
    Disconnect(DisconnectMessage),
}

impl OutboundMessage {
    /// Returns the `type` discriminator (empty for plain broadcasts).
    #[must_use]
    pub fn message_type(&self) -> &str {
        match self {
            Self::Reply(r) => &r.reply_type,
            Self::Ping(p) => p.message_type,
            Self::Disconnect(d) => &d.message_type,
        }
    }
}

impl From<Reply> for OutboundMessage {
    fn from(r: Reply) -> Self {
        Self::Reply(r)
    }
}

impl From<PingMessage> for OutboundMessage {
    fn from(p: PingMessage) -> Self {
        Self::Ping(p)
    }
}

impl From<DisconnectMessage> for OutboundMessage {
    fn from(d: DisconnectMessage) -> Self {
        Self::Disconnect(d)
    }
}

fn embed(data: &str) -> Value {
    serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()))
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_embeds_json_payloads() {
        let reply = Reply::broadcast("chat", r#"{"text":"hi"}"#);
        assert_eq!(reply.message, serde_json::json!({"text": "hi"}));

        let reply = Reply::broadcast("chat", "hello");
        let json = serde_json::to_value(&reply).unwrap_or_default();
        assert_eq!(
            json,
            serde_json::json!({"identifier": "chat", "message": "hello"})
        );
    }

    #[test]
    fn ping_precision_scales_timestamp() {
        let s = PingMessage::now(PingPrecision::Seconds).message;
        let ms = PingMessage::now(PingPrecision::Millis).message;
        assert!(ms / 1000 >= s);
        assert!(ms / 1000 - s <= 1);

        let json = serde_json::to_value(PingMessage::now(PingPrecision::Millis))
            .unwrap_or_default();
        assert_eq!(json.get("type"), Some(&serde_json::json!("ping")));
    }

    #[test]
    fn position_requires_all_parts() {
        let reply = Reply::broadcast("chat", "x").with_position("room:1", "ep", 3);
        assert!(reply.has_position());
        assert!(!Reply::broadcast("chat", "x").has_position());
        assert!(!Reply::broadcast("chat", "x")
            .with_position("room:1", "", 3)
            .has_position());
    }

    #[test]
    fn outbound_type_discriminator() {
        let msg = OutboundMessage::from(DisconnectMessage::new("remote", false));
        assert_eq!(msg.message_type(), "disconnect");
        let msg = OutboundMessage::from(Reply::broadcast("chat", "x"));
        assert_eq!(msg.message_type(), "");
    }
}
