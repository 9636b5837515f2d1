//! Gateway error types.
//!
//! [`GatewayError`] is the central error type for the gateway. Each
//! collaborator boundary has its own narrower error ([`TransportError`],
//! [`ControllerError`], [`BrokerError`], [`EncodeError`]) that converts into
//! it. On the HTTP surface every variant maps to a status code and a
//! structured JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::controller::CommandResult;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 1001,
///     "message": "invalid request: malformed pub/sub message",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Failure of the byte-level client transport.
///
/// Every transport error is fatal to the session that observed it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the connection (clean close handshake or EOF).
    #[error("connection closed")]
    Closed,

    /// A write did not complete before its deadline.
    #[error("write deadline exceeded")]
    Timeout,

    /// Any other I/O failure.
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// Failure reported by the business-logic controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    /// The connection was rejected by authentication.
    #[error("unauthorized")]
    Unauthorized,

    /// The controller rejected the command.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// The controller backend could not be reached or failed internally.
    #[error("controller unavailable: {0}")]
    Unavailable(String),

    /// The controller rejected the command and still requests side
    /// effects: replies to transmit, or a disconnect.
    #[error("command rejected: {reason}")]
    RejectedWith {
        /// Why the command was rejected.
        reason: String,
        /// Transmissions and disconnect flag to honor. Stream changes are
        /// ignored.
        result: Box<CommandResult>,
    },
}

impl ControllerError {
    /// Rejection carrying `result`.
    #[must_use]
    pub fn rejected_with(reason: impl Into<String>, result: CommandResult) -> Self {
        Self::RejectedWith {
            reason: reason.into(),
            result: Box::new(result),
        }
    }

    /// The result attached to a rejection, if any.
    #[must_use]
    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            Self::RejectedWith { result, .. } => Some(result.as_ref()),
            _ => None,
        }
    }
}

/// Failure reported by a broker implementation.
///
/// `HistoryUnavailable` is deliberately distinct from an empty history: it
/// means the requested position cannot be served without a gap.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// History cannot be served continuously from the requested position
    /// (epoch mismatch, evicted offset, unknown stream).
    #[error("history unavailable for stream {stream}: {reason}")]
    HistoryUnavailable {
        /// Stream the history was requested for.
        stream: String,
        /// Why the history cannot be served.
        reason: String,
    },

    /// The broker does not implement the requested capability.
    #[error("operation not supported by broker: {0}")]
    NotSupported(&'static str),

    /// The storage backend failed.
    #[error("broker persistence error: {0}")]
    Persistence(String),

    /// Shutdown did not finish before its deadline.
    #[error("broker shutdown deadline exceeded")]
    ShutdownTimeout,
}

impl BrokerError {
    /// Builds a [`BrokerError::HistoryUnavailable`] for `stream`.
    #[must_use]
    pub fn history_unavailable(stream: &str, reason: impl Into<String>) -> Self {
        Self::HistoryUnavailable {
            stream: stream.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Failure to convert between typed messages and wire frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The encoder does not support this direction.
    #[error("{0} is not supported by this encoder")]
    Unsupported(&'static str),

    /// The payload could not be (de)serialized.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for EncodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Crate-wide error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category    | HTTP Status                |
/// |-----------|-------------|----------------------------|
/// | 1000–1999 | Validation  | 400 Bad Request            |
/// | 2000–2999 | Session     | 401 / 409                  |
/// | 3000–3999 | Server      | 500 / 503                  |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed inbound message.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Client transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Controller failure.
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Broker failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Encoder failure.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The session is already closed.
    #[error("session {0} is closed")]
    SessionClosed(String),

    /// A background component stopped accepting work.
    #[error("{0} is shut down")]
    Stopped(&'static str),

    /// One or more shutdown stages failed.
    #[error("shutdown failed: {}", .0.join("; "))]
    Shutdown(Vec<String>),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::Encode(_) => 1002,
            Self::Controller(ControllerError::Unauthorized) => 2001,
            Self::Controller(_) => 2002,
            Self::SessionClosed(_) => 2003,
            Self::Transport(_) => 2004,
            Self::Internal(_) => 3000,
            Self::Broker(_) => 3001,
            Self::Stopped(_) => 3002,
            Self::Shutdown(_) => 3003,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::Encode(_) => StatusCode::BAD_REQUEST,
            Self::Controller(ControllerError::Unauthorized) => StatusCode::UNAUTHORIZED,
            Self::Controller(_) | Self::SessionClosed(_) | Self::Transport(_) => {
                StatusCode::CONFLICT
            }
            Self::Stopped(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Broker(_) | Self::Shutdown(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
