//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::broker::{BroadcastHandler, Broker, NoopBroker};
use crate::config::NodeConfig;
use crate::controller::{CommandResult, ConnectResult, Controller};
use crate::domain::{RemoteCommand, SessionEnv, StreamMessage};
use crate::error::{BrokerError, ControllerError, TransportError};
use crate::transport::{CloseCode, Connection, Frame};

/// Node settings that keep timers out of the way of the test.
pub(crate) fn quiet_config() -> NodeConfig {
    NodeConfig {
        ping_interval: Duration::from_secs(600),
        disconnect_rate: 1000,
        ..NodeConfig::default()
    }
}

/// Polls `check` every few milliseconds until it holds or a second passes.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// In-memory connection recording everything written to it.
#[derive(Debug)]
pub(crate) struct MockConnection {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    frames: Mutex<Vec<Frame>>,
    closes: Mutex<Vec<(CloseCode, String)>>,
    fail_writes: AtomicBool,
}

impl MockConnection {
    /// Returns the connection and the feed of inbound client messages.
    /// Dropping the feed makes `read` report a closed peer.
    pub(crate) fn new() -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(rx),
            frames: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        });
        (conn, tx)
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Text payloads written so far.
    pub(crate) fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn closes(&self) -> Vec<(CloseCode, String)> {
        self.closes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn write(&self, frame: &Frame, _deadline: Instant) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("broken pipe".to_string()));
        }
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());
        Ok(())
    }

    async fn close(&self, code: CloseCode, reason: &str) {
        self.closes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((code, reason.to_string()));
    }
}

/// Controller returning queued results and counting calls.
#[derive(Debug, Default)]
pub(crate) struct MockController {
    reject_auth: AtomicBool,
    subscribe_results: Mutex<VecDeque<Result<CommandResult, ControllerError>>>,
    perform_results: Mutex<VecDeque<Result<CommandResult, ControllerError>>>,
    pub(crate) subscribe_calls: AtomicUsize,
    pub(crate) unsubscribe_calls: AtomicUsize,
    pub(crate) perform_calls: AtomicUsize,
    pub(crate) disconnect_calls: AtomicUsize,
    pub(crate) disconnected: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockController {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn reject_auth(&self) {
        self.reject_auth.store(true, Ordering::SeqCst);
    }

    /// Queues the result of the next `subscribe` call.
    pub(crate) fn on_subscribe(&self, result: Result<CommandResult, ControllerError>) {
        self.subscribe_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Queues the result of the next `perform` call.
    pub(crate) fn on_perform(&self, result: Result<CommandResult, ControllerError>) {
        self.perform_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    fn next(
        queue: &Mutex<VecDeque<Result<CommandResult, ControllerError>>>,
    ) -> Result<CommandResult, ControllerError> {
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(CommandResult::default()))
    }
}

#[async_trait]
impl Controller for MockController {
    async fn authenticate(
        &self,
        _sid: &str,
        _env: &SessionEnv,
    ) -> Result<ConnectResult, ControllerError> {
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(ControllerError::Unauthorized);
        }
        Ok(ConnectResult {
            identifiers: "user:1".to_string(),
            transmissions: vec![r#"{"type":"welcome"}"#.to_string()],
        })
    }

    async fn subscribe(
        &self,
        _sid: &str,
        _identifiers: &str,
        _channel: &str,
    ) -> Result<CommandResult, ControllerError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Self::next(&self.subscribe_results)
    }

    async fn unsubscribe(
        &self,
        _sid: &str,
        _identifiers: &str,
        _channel: &str,
    ) -> Result<CommandResult, ControllerError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(CommandResult::default())
    }

    async fn perform(
        &self,
        _sid: &str,
        _identifiers: &str,
        _channel: &str,
        _data: &str,
    ) -> Result<CommandResult, ControllerError> {
        self.perform_calls.fetch_add(1, Ordering::SeqCst);
        Self::next(&self.perform_results)
    }

    async fn disconnect(
        &self,
        sid: &str,
        _identifiers: &str,
        subscriptions: &[String],
        _env: &SessionEnv,
    ) -> Result<(), ControllerError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.disconnected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((sid.to_string(), subscriptions.to_vec()));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ControllerError> {
        Ok(())
    }
}

/// Broadcast handler recording what a broker forwarded.
#[derive(Debug, Default)]
pub(crate) struct RecordingHandler {
    pub(crate) broadcasts: Mutex<Vec<StreamMessage>>,
    pub(crate) commands: Mutex<Vec<RemoteCommand>>,
}

impl RecordingHandler {
    pub(crate) fn broadcasts(&self) -> Vec<StreamMessage> {
        self.broadcasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BroadcastHandler for RecordingHandler {
    async fn broadcast(&self, msg: StreamMessage) {
        self.broadcasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg);
    }

    async fn execute_remote_command(&self, cmd: RemoteCommand) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cmd);
    }
}

/// Fan-out-only broker recording the interest tokens the Hub obtains.
#[derive(Debug, Default)]
pub(crate) struct RecordingBroker {
    inner: NoopBroker,
    tokens: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingBroker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `("subscribe" | "unsubscribe", token)` pairs with a non-empty token.
    pub(crate) fn tokens(&self) -> Vec<(&'static str, String)> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, op: &'static str, token: String) -> String {
        if !token.is_empty() {
            self.tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((op, token.clone()));
        }
        token
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    fn announce(&self) -> String {
        "recording broker".to_string()
    }

    async fn start(&self, handler: Arc<dyn BroadcastHandler>) -> Result<(), BrokerError> {
        self.inner.start(handler).await
    }

    async fn shutdown(&self, deadline: Instant) -> Result<(), BrokerError> {
        self.inner.shutdown(deadline).await
    }

    fn subscribe(&self, stream: &str) -> String {
        self.record("subscribe", self.inner.subscribe(stream))
    }

    fn unsubscribe(&self, stream: &str) -> String {
        self.record("unsubscribe", self.inner.unsubscribe(stream))
    }

    async fn handle_broadcast(&self, msg: StreamMessage) {
        self.inner.handle_broadcast(msg).await;
    }

    async fn handle_command(&self, cmd: RemoteCommand) {
        self.inner.handle_command(cmd).await;
    }

    async fn history_from(
        &self,
        stream: &str,
        epoch: &str,
        offset: u64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        self.inner.history_from(stream, epoch, offset).await
    }

    async fn history_since(
        &self,
        stream: &str,
        since: i64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        self.inner.history_since(stream, since).await
    }

    async fn commit_session(&self, sid: &str, state: &[u8]) -> Result<(), BrokerError> {
        self.inner.commit_session(sid, state).await
    }

    async fn restore_session(&self, sid: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        self.inner.restore_session(sid).await
    }

    async fn finish_session(&self, sid: &str) -> Result<(), BrokerError> {
        self.inner.finish_session(sid).await
    }
}
