//! Plain JSON text frames.

use super::Encoder;
use crate::domain::{Command, OutboundMessage};
use crate::error::EncodeError;
use crate::transport::Frame;

/// Encodes every message as a JSON text frame. Transmissions pass through
/// untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn id(&self) -> &'static str {
        "json"
    }

    fn encode(&self, msg: &OutboundMessage) -> Result<Frame, EncodeError> {
        Ok(Frame::Text(serde_json::to_string(msg)?))
    }

    fn encode_transmission(&self, raw: &str) -> Result<Frame, EncodeError> {
        Ok(Frame::Text(raw.to_string()))
    }

    fn decode(&self, raw: &[u8]) -> Result<Command, EncodeError> {
        Ok(Command::parse(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Reply;

    #[test]
    fn transmissions_are_verbatim() {
        let raw = r#"{"type":"welcome"}"#;
        assert_eq!(
            JsonEncoder.encode_transmission(raw),
            Ok(Frame::Text(raw.to_string()))
        );
    }

    #[test]
    fn encodes_reply_as_text() {
        let msg = OutboundMessage::from(Reply::broadcast("chat", "hello"));
        assert_eq!(
            JsonEncoder.encode(&msg),
            Ok(Frame::Text(r#"{"identifier":"chat","message":"hello"}"#.to_string()))
        );
    }

    #[test]
    fn decode_reports_malformed_input() {
        assert!(matches!(
            JsonEncoder.decode(b"nope"),
            Err(EncodeError::Malformed(_))
        ));
    }
}
