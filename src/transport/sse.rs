//! Server-Sent Events transport: a one-way session whose frames are
//! streamed as the body of a long-lived HTTP response.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use utoipa::IntoParams;

use super::{CloseCode, Connection, Frame, session_env};
use crate::app_state::AppState;
use crate::encoders::SseEncoder;
use crate::error::TransportError;
use crate::node::Session;

const BODY_BUFFER: usize = 64;

/// [`Connection`] feeding an SSE response body.
///
/// There is nothing to read: `read` waits until the connection is closed.
#[derive(Debug)]
pub struct SseConnection {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    closed: watch::Sender<bool>,
}

impl SseConnection {
    /// Creates the connection and the response body it writes to.
    #[must_use]
    pub fn new() -> (Arc<Self>, Body) {
        let (tx, rx) = mpsc::channel::<String>(BODY_BUFFER);
        let (closed, _) = watch::channel(false);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
        });
        let conn = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            closed,
        });
        (conn, Body::from_stream(stream))
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connection for SseConnection {
    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut closed = self.closed.subscribe();
        loop {
            let is_closed = *closed.borrow_and_update();
            if is_closed || closed.changed().await.is_err() {
                break;
            }
        }
        Err(TransportError::Closed)
    }

    async fn write(&self, frame: &Frame, deadline: Instant) -> Result<(), TransportError> {
        let chunk = match frame {
            Frame::Text(text) => format!("{text}\n\n"),
            Frame::Binary(_) => return Err(TransportError::Io("binary frames over SSE".to_string())),
            Frame::Close { code, reason } => {
                self.close(*code, reason).await;
                return Ok(());
            }
        };
        let tx = self.sender().ok_or(TransportError::Closed)?;
        tokio::time::timeout_at(deadline, tx.send(chunk))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self, _code: CloseCode, _reason: &str) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.send_replace(true);
    }
}

/// Query parameters of `GET /events`.
#[derive(Debug, Deserialize, IntoParams)]
pub struct EventsQuery {
    /// Channel identifier to subscribe right after connecting.
    pub identifier: Option<String>,
}

/// `GET /events` — Server-Sent Events session.
#[utoipa::path(
    get,
    path = "/events",
    tag = "Transport",
    summary = "Server-Sent Events session",
    description = "Opens a one-way session. When `identifier` is given the session subscribes to it right after authentication.",
    params(EventsQuery),
    responses(
        (status = 200, description = "Event stream", body = String, content_type = "text/event-stream"),
        (status = 401, description = "Rejected by the controller", body = crate::error::ErrorResponse),
    )
)]
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let (conn, body) = SseConnection::new();
    let session = Session::new(
        &state.node,
        uuid::Uuid::new_v4().to_string(),
        conn,
        Arc::new(SseEncoder),
        session_env(&uri, &headers),
    );

    if let Err(err) = state.node.authenticate(&session).await {
        session.disconnect("unauthorized", CloseCode::Normal).await;
        return err.into_response();
    }
    if let Some(identifier) = query.identifier.filter(|i| !i.is_empty()) {
        session.subscribe(&identifier).await;
    }

    tokio::spawn(async move { session.serve().await });

    (
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response()
}
