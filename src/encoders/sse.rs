//! Server-Sent Events rendering.
//!
//! ```text
//! event: <type>
//! data: <json>
//! id: <offset>/<epoch>/<stream>
//! retry: <ms>
//! ```
//!
//! `event` is omitted for untyped broadcasts, `id` only appears when the
//! reply carries a full resume cursor, `retry` only for disconnects that
//! forbid reconnecting.

use super::Encoder;
use crate::domain::{Command, OutboundMessage, Reply};
use crate::error::EncodeError;
use crate::transport::Frame;

/// Retry delay (one year, in ms) telling the client not to come back.
pub const RETRY_NO_RECONNECT: u64 = 31_536_000_000;

/// Encodes messages as SSE events. Decoding is unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct SseEncoder;

impl Encoder for SseEncoder {
    fn id(&self) -> &'static str {
        "sse"
    }

    fn encode(&self, msg: &OutboundMessage) -> Result<Frame, EncodeError> {
        let json = serde_json::to_string(msg)?;
        let msg_type = msg.message_type();

        let mut payload = String::with_capacity(json.len() + 32);
        if !msg_type.is_empty() {
            payload.push_str("event: ");
            payload.push_str(msg_type);
            payload.push('\n');
        }
        payload.push_str("data: ");
        payload.push_str(&json);

        match msg {
            OutboundMessage::Reply(reply) if reply.has_position() => {
                payload.push_str(&format!(
                    "\nid: {}/{}/{}",
                    reply.offset, reply.epoch, reply.stream_id
                ));
            }
            OutboundMessage::Disconnect(d) if !d.reconnect => {
                payload.push_str(&format!("\nretry: {RETRY_NO_RECONNECT}"));
            }
            _ => {}
        }

        Ok(Frame::Text(payload))
    }

    fn encode_transmission(&self, raw: &str) -> Result<Frame, EncodeError> {
        let reply: Reply = serde_json::from_str(raw)?;
        self.encode(&OutboundMessage::Reply(reply))
    }

    fn decode(&self, _raw: &[u8]) -> Result<Command, EncodeError> {
        Err(EncodeError::Unsupported("decoding"))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::DisconnectMessage;

    fn text(frame: Result<Frame, EncodeError>) -> String {
        let Ok(Frame::Text(s)) = frame else {
            panic!("expected text frame");
        };
        s
    }

    #[test]
    fn typed_reply_has_event_line() {
        let out = text(SseEncoder.encode(&Reply::typed("welcome", "").into()));
        assert_eq!(out, "event: welcome\ndata: {\"type\":\"welcome\"}");
    }

    #[test]
    fn broadcast_with_cursor_has_id_line() {
        let reply = Reply::broadcast("chat", "hello").with_position("room:1", "bc", 42);
        let out = text(SseEncoder.encode(&reply.into()));
        assert!(!out.starts_with("event:"));
        assert!(out.ends_with("\nid: 42/bc/room:1"));
    }

    #[test]
    fn non_reconnecting_disconnect_sets_retry() {
        let out = text(SseEncoder.encode(&DisconnectMessage::new("unauthorized", false).into()));
        assert!(out.starts_with("event: disconnect\n"));
        assert!(out.ends_with("\nretry: 31536000000"));

        let out = text(SseEncoder.encode(&DisconnectMessage::new("restart", true).into()));
        assert!(!out.contains("retry:"));
    }

    #[test]
    fn transmissions_are_reencoded() {
        let out = text(SseEncoder.encode_transmission(
            r#"{"type":"confirm_subscription","identifier":"chat"}"#,
        ));
        assert!(out.starts_with("event: confirm_subscription\ndata: "));
        assert!(SseEncoder.encode_transmission("not json").is_err());
    }

    #[test]
    fn decoding_is_unsupported() {
        assert_eq!(
            SseEncoder.decode(b"{}"),
            Err(EncodeError::Unsupported("decoding"))
        );
    }
}
