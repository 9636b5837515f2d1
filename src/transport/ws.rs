//! WebSocket transport over Axum.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Uri};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CloseCode, Connection, Frame, session_env};
use crate::app_state::AppState;
use crate::domain::SessionEnv;
use crate::encoders::JsonEncoder;
use crate::error::TransportError;
use crate::node::{Node, Session};

const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// [`Connection`] over an upgraded Axum WebSocket.
///
/// The socket is split so a blocked read never holds up writes.
pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
}

impl WsConnection {
    /// Wraps an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().as_bytes().to_vec()),
                Some(Ok(Message::Binary(bytes))) => return Ok(bytes.to_vec()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(TransportError::Io(err.to_string())),
            }
        }
    }

    async fn write(&self, frame: &Frame, deadline: Instant) -> Result<(), TransportError> {
        let msg = match frame {
            Frame::Text(text) => Message::text(text.clone()),
            Frame::Binary(bytes) => Message::binary(bytes.clone()),
            Frame::Close { code, reason } => {
                self.close(*code, reason).await;
                return Ok(());
            }
        };

        tokio::time::timeout_at(deadline, async {
            self.sink.lock().await.send(msg).await
        })
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut sink = self.sink.lock().await;
        // 1006 must not appear on the wire: an abnormal close just drops
        // the connection.
        if code == CloseCode::Normal {
            let frame = CloseFrame {
                code: code.as_u16(),
                reason: reason.to_string().into(),
            };
            let _ = tokio::time::timeout(CLOSE_WAIT, sink.send(Message::Close(Some(frame)))).await;
        }
        let _ = tokio::time::timeout(CLOSE_WAIT, sink.close()).await;
    }
}

/// `GET /ws` — Upgrade to a WebSocket session speaking JSON.
#[utoipa::path(
    get,
    path = "/ws",
    tag = "Transport",
    summary = "WebSocket session",
    description = "Upgrades to a WebSocket. Client commands and server replies are JSON text frames.",
    responses(
        (status = 101, description = "Switching protocols"),
    )
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    let env = session_env(&uri, &headers);
    ws.on_upgrade(move |socket| serve_socket(state.node, socket, env))
}

async fn serve_socket(node: Arc<Node>, socket: WebSocket, env: SessionEnv) {
    let session = Session::new(
        &node,
        uuid::Uuid::new_v4().to_string(),
        Arc::new(WsConnection::new(socket)),
        Arc::new(JsonEncoder),
        env,
    );

    if let Err(err) = node.authenticate(&session).await {
        tracing::debug!(sid = %session.uid(), error = %err, "rejecting websocket");
        session.disconnect_with_message("unauthorized", false).await;
        return;
    }
    session.serve().await;
}
