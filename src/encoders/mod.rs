//! Wire encoders: typed outbound messages → transport frames.
//!
//! [`JsonEncoder`] is the WebSocket default; [`SseEncoder`] renders
//! Server-Sent Events and only works server → client.

pub mod json;
pub mod sse;

use std::fmt;

use crate::domain::{Command, OutboundMessage};
use crate::error::EncodeError;
use crate::transport::Frame;

pub use json::JsonEncoder;
pub use sse::SseEncoder;

/// Converts between typed messages and wire frames.
pub trait Encoder: Send + Sync + fmt::Debug {
    /// Short identifier of the wire format.
    fn id(&self) -> &'static str;

    /// Encodes a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the message cannot be serialized.
    fn encode(&self, msg: &OutboundMessage) -> Result<Frame, EncodeError>;

    /// Encodes a raw JSON transmission produced by the controller.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the encoder needs to parse `raw` and it is
    /// malformed.
    fn encode_transmission(&self, raw: &str) -> Result<Frame, EncodeError>;

    /// Decodes an inbound client frame.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] on malformed input or when the encoder does
    /// not support decoding.
    fn decode(&self, raw: &[u8]) -> Result<Command, EncodeError>;
}
