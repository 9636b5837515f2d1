//! Transport layer: the frame/connection abstraction sessions write to,
//! plus the WebSocket and SSE adapters that implement it over Axum.

pub mod sse;
pub mod ws;

use std::fmt;

use async_trait::async_trait;
use axum::http::{HeaderMap, Uri};
use tokio::time::Instant;

use crate::domain::SessionEnv;
use crate::error::TransportError;

/// Close status attached to a closing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Graceful shutdown of the session.
    Normal,
    /// Read/write failure, deadline expiry or send queue overflow.
    Abnormal,
}

impl CloseCode {
    /// WebSocket status code for this close.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Abnormal => 1006,
        }
    }
}

/// A unit of outbound data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text payload.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Close the transport.
    Close {
        /// Close status.
        code: CloseCode,
        /// Human-readable reason for logs and the peer.
        reason: String,
    },
}

/// Byte-level client connection.
///
/// Implementations must tolerate `write` being called concurrently with
/// `read`, and concurrent writes (keepalive pings bypass the send queue);
/// writes are serialized internally.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Reads the next inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the peer closed the
    /// connection, any other variant on failure.
    async fn read(&self) -> Result<Vec<u8>, TransportError>;

    /// Writes one data frame, giving up at `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the deadline passes.
    async fn write(&self, frame: &Frame, deadline: Instant) -> Result<(), TransportError>;

    /// Closes the connection. Idempotent.
    async fn close(&self, code: CloseCode, reason: &str);
}

/// Captures the request path (with query) and the UTF-8 headers.
#[must_use]
pub fn session_env(uri: &Uri, headers: &HeaderMap) -> SessionEnv {
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);
    SessionEnv::new(
        path,
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?.to_string()))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_env_keeps_query_and_readable_headers() {
        let uri = Uri::from_static("/events?identifier=chat");
        let mut headers = HeaderMap::new();
        headers.insert("x-restore-sid", axum::http::HeaderValue::from_static("abc"));

        let env = session_env(&uri, &headers);
        assert_eq!(env.path, "/events?identifier=chat");
        assert_eq!(env.restore_sid(), Some("abc"));
    }

    #[test]
    fn abnormal_close_code_is_1006() {
        assert_eq!(CloseCode::Abnormal.as_u16(), 1006);
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
    }
}
