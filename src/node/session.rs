//! One client connection: send queue, keepalive and protocol state.
//!
//! Two locks guard a session and they are never nested:
//!
//! - the transport lock (`std::sync::Mutex`) covers `connected`, `closed`
//!   and the send queue sender. It is held for a few instructions and never
//!   across an `.await`.
//! - the protocol lock (`tokio::sync::Mutex`) covers the channel
//!   subscriptions. Subscribe and unsubscribe hold it across the controller
//!   call so commands on one identifier cannot interleave.
//!
//! The send queue has one slot more than its capacity. Data frames may not
//! take the last slot, so the close frame always fits. Broadcasts never
//! wait for room; history replay does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::Node;
use crate::controller::CommandResult;
use crate::domain::{
    Command, DisconnectMessage, OutboundMessage, PingMessage, SessionEnv, SessionSnapshot,
};
use crate::encoders::Encoder;
use crate::error::{ControllerError, EncodeError, TransportError};
use crate::transport::{CloseCode, Connection, Frame};

#[derive(Debug)]
struct TransportState {
    connected: bool,
    closed: bool,
    sender: Option<mpsc::Sender<Frame>>,
}

type Subscriptions = BTreeMap<String, BTreeSet<String>>;

/// An authenticated (or authenticating) client connection.
#[derive(Debug)]
pub struct Session {
    uid: String,
    env: SessionEnv,
    node: Arc<Node>,
    conn: Arc<dyn Connection>,
    encoder: Arc<dyn Encoder>,
    identifiers: Mutex<String>,
    transport: Mutex<TransportState>,
    subscriptions: tokio::sync::Mutex<Subscriptions>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Creates a session and starts its send loop and keepalive.
    #[must_use]
    pub fn new(
        node: &Arc<Node>,
        uid: String,
        conn: Arc<dyn Connection>,
        encoder: Arc<dyn Encoder>,
        env: SessionEnv,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(node.config().send_queue_capacity + 1);
        let (closed_tx, closed_rx) = watch::channel(false);

        let session = Arc::new(Self {
            uid,
            env,
            node: Arc::clone(node),
            conn,
            encoder,
            identifiers: Mutex::new(String::new()),
            transport: Mutex::new(TransportState {
                connected: false,
                closed: false,
                sender: Some(tx),
            }),
            subscriptions: tokio::sync::Mutex::new(BTreeMap::new()),
            closed_tx,
        });

        tokio::spawn(send_loop(Arc::clone(&session), rx));
        tokio::spawn(ping_loop(Arc::clone(&session), closed_rx));
        session
    }

    /// Unique session id.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Request path and headers captured at connect time.
    #[must_use]
    pub fn env(&self) -> &SessionEnv {
        &self.env
    }

    /// Connection identifiers returned by authentication.
    #[must_use]
    pub fn identifiers(&self) -> String {
        self.identifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_identifiers(&self, identifiers: String) {
        *self.identifiers.lock().unwrap_or_else(PoisonError::into_inner) = identifiers;
    }

    /// Returns `true` once authenticated and until disconnected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connected
    }

    /// Returns `true` once the transport is torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Marks the session connected; fails if it was closed meanwhile.
    pub(crate) fn mark_connected(&self) -> bool {
        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        if transport.closed {
            return false;
        }
        transport.connected = true;
        true
    }

    /// Channel identifiers with an active subscription.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    /// Streams attached to `identifier`; `None` when not subscribed.
    pub(crate) async fn streams_of(&self, identifier: &str) -> Option<BTreeSet<String>> {
        self.subscriptions.lock().await.get(identifier).cloned()
    }

    pub(crate) fn decode(&self, raw: &[u8]) -> Result<Command, EncodeError> {
        self.encoder.decode(raw)
    }

    /// Encodes and queues `msg`. Never waits: a full queue disconnects the
    /// session.
    pub fn send(self: &Arc<Self>, msg: &OutboundMessage) {
        match self.encoder.encode(msg) {
            Ok(frame) => self.enqueue(frame),
            Err(err) => {
                tracing::warn!(sid = %self.uid, error = %err, "failed to encode message");
            }
        }
    }

    /// Queues a raw controller transmission.
    pub fn transmit(self: &Arc<Self>, raw: &str) {
        match self.encoder.encode_transmission(raw) {
            Ok(frame) => self.enqueue(frame),
            Err(err) => {
                tracing::warn!(sid = %self.uid, error = %err, "failed to encode transmission");
            }
        }
    }

    fn enqueue(self: &Arc<Self>, frame: Frame) {
        let accepted = {
            let transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = transport.sender.as_ref() else {
                return;
            };
            sender.capacity() > 1 && sender.try_send(frame).is_ok()
        };
        if !accepted {
            self.overflow();
        }
    }

    /// Encodes and queues `msg`, waiting for room instead of overflowing.
    /// Returns `false` once the session is closed. A queue that stays full
    /// for the write timeout disconnects the session.
    pub(crate) async fn send_paced(self: &Arc<Self>, msg: &OutboundMessage) -> bool {
        let frame = match self.encoder.encode(msg) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(sid = %self.uid, error = %err, "failed to encode message");
                return true;
            }
        };
        let sender = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .clone();
        let Some(sender) = sender else {
            return false;
        };

        // One permit carries the frame; the other keeps the close slot free.
        let timeout = self.node.config().write_timeout;
        match tokio::time::timeout(timeout, sender.reserve_many(2)).await {
            Ok(Ok(mut permits)) => {
                if let Some(permit) = permits.next() {
                    permit.send(frame);
                }
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                self.overflow();
                false
            }
        }
    }

    fn overflow(self: &Arc<Self>) {
        tracing::warn!(sid = %self.uid, "send queue overflow");
        self.close(CloseCode::Abnormal, "send queue overflow");
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session
                .disconnect("send queue overflow", CloseCode::Abnormal)
                .await;
        });
    }

    /// Tears the session down. Idempotent: the node is notified only by the
    /// first call made while connected, and one close frame is sent.
    pub async fn disconnect(self: &Arc<Self>, reason: &str, code: CloseCode) {
        let was_connected = {
            let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut transport.connected, false)
        };
        self.close(code, reason);
        if was_connected {
            self.node.disconnect(self).await;
        }
    }

    /// Sends a disconnect notice, then disconnects with a normal closure.
    pub async fn disconnect_with_message(self: &Arc<Self>, reason: &str, reconnect: bool) {
        self.send(&DisconnectMessage::new(reason, reconnect).into());
        self.disconnect(reason, CloseCode::Normal).await;
    }

    fn close(&self, code: CloseCode, reason: &str) {
        {
            let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
            if transport.closed {
                return;
            }
            transport.closed = true;
            if let Some(sender) = transport.sender.take() {
                let frame = Frame::Close {
                    code,
                    reason: reason.to_string(),
                };
                if sender.try_send(frame).is_err() {
                    tracing::debug!(sid = %self.uid, "send loop already gone");
                }
            }
        }
        self.closed_tx.send_replace(true);
        tracing::debug!(sid = %self.uid, reason, "session closed");
    }

    /// Reads client messages until the transport fails, then disconnects.
    pub async fn serve(self: &Arc<Self>) {
        loop {
            match self.conn.read().await {
                Ok(raw) => self.node.handle_command(self, &raw).await,
                Err(TransportError::Closed) => {
                    self.disconnect("read closed", CloseCode::Normal).await;
                    return;
                }
                Err(err) => {
                    tracing::debug!(sid = %self.uid, error = %err, "read failed");
                    self.disconnect("read failed", CloseCode::Abnormal).await;
                    return;
                }
            }
        }
    }

    /// Attaches `identifier`. Duplicate subscriptions are ignored.
    pub async fn subscribe(self: &Arc<Self>, identifier: &str) {
        let disconnect = {
            let mut subs = self.subscriptions.lock().await;
            if subs.contains_key(identifier) {
                tracing::warn!(sid = %self.uid, identifier, "already subscribed");
                return;
            }
            let res = self
                .node
                .controller()
                .subscribe(&self.uid, &self.identifiers(), identifier)
                .await;
            match res {
                Ok(res) => {
                    subs.insert(identifier.to_string(), BTreeSet::new());
                    self.apply(&mut subs, identifier, res).await
                }
                Err(err) => self.reject("subscribe", identifier, &err),
            }
        };
        self.finish_command(disconnect).await;
    }

    /// Detaches `identifier` and every stream attached to it.
    pub async fn unsubscribe(self: &Arc<Self>, identifier: &str) {
        let disconnect = {
            let mut subs = self.subscriptions.lock().await;
            if !subs.contains_key(identifier) {
                tracing::warn!(sid = %self.uid, identifier, "unknown subscription");
                return;
            }
            let res = self
                .node
                .controller()
                .unsubscribe(&self.uid, &self.identifiers(), identifier)
                .await;
            match res {
                Ok(mut res) => {
                    res.stop_all_streams = true;
                    let disconnect = self.apply(&mut subs, identifier, res).await;
                    subs.remove(identifier);
                    disconnect
                }
                Err(err) => self.reject("unsubscribe", identifier, &err),
            }
        };
        self.finish_command(disconnect).await;
    }

    /// Runs a channel action on a subscribed `identifier`.
    pub async fn perform(self: &Arc<Self>, identifier: &str, data: &str) {
        if !self.subscriptions.lock().await.contains_key(identifier) {
            tracing::warn!(sid = %self.uid, identifier, "perform on unknown subscription");
            return;
        }
        let res = self
            .node
            .controller()
            .perform(&self.uid, &self.identifiers(), identifier, data)
            .await;
        let disconnect = match res {
            Ok(res) => {
                let mut subs = self.subscriptions.lock().await;
                if subs.contains_key(identifier) {
                    self.apply(&mut subs, identifier, res).await
                } else {
                    // Unsubscribed while the action ran: only deliver replies.
                    for raw in &res.transmissions {
                        self.transmit(raw);
                    }
                    res.disconnect
                }
            }
            Err(err) => self.reject("perform", identifier, &err),
        };
        self.finish_command(disconnect).await;
    }

    /// Reinstates subscriptions from a snapshot and re-attaches their
    /// streams. The session must already be registered with the Hub.
    pub(crate) async fn restore_subscriptions(&self, restored: Subscriptions) {
        let mut subs = self.subscriptions.lock().await;
        for (identifier, streams) in &restored {
            for stream in streams {
                self.node.hub().subscribe(&self.uid, stream, identifier).await;
            }
        }
        *subs = restored;
    }

    /// Serialized protocol state for the broker.
    pub(crate) async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identifiers: self.identifiers(),
            subscriptions: self.subscriptions.lock().await.clone(),
        }
    }

    /// Applies a controller result for `identifier` under the protocol
    /// lock. Returns whether the session must be disconnected afterwards.
    async fn apply(
        self: &Arc<Self>,
        subs: &mut Subscriptions,
        identifier: &str,
        res: CommandResult,
    ) -> bool {
        let hub = self.node.hub();
        let streams = subs.entry(identifier.to_string()).or_default();

        if res.stop_all_streams {
            hub.unsubscribe(&self.uid, identifier).await;
            streams.clear();
        }
        for stream in res.streams {
            hub.subscribe(&self.uid, &stream, identifier).await;
            streams.insert(stream);
        }
        for raw in &res.transmissions {
            self.transmit(raw);
        }
        res.disconnect
    }

    async fn finish_command(self: &Arc<Self>, disconnect: bool) {
        self.node.commit_session(self).await;
        if disconnect {
            self.disconnect("command failed", CloseCode::Normal).await;
        }
    }

    /// Delivers the replies a failed command still carries, leaving
    /// subscriptions untouched. Returns the result's disconnect flag.
    fn reject(
        self: &Arc<Self>,
        command: &str,
        identifier: &str,
        err: &ControllerError,
    ) -> bool {
        tracing::error!(sid = %self.uid, identifier, command, error = %err, "controller call failed");
        let Some(res) = err.result() else {
            return false;
        };
        for raw in &res.transmissions {
            self.transmit(raw);
        }
        res.disconnect
    }

    async fn ping(&self) -> bool {
        if self.is_closed() {
            return true;
        }
        let config = self.node.config();
        let msg = OutboundMessage::from(PingMessage::now(config.ping_precision));
        let frame = match self.encoder.encode(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(sid = %self.uid, error = %err, "failed to encode ping");
                return true;
            }
        };
        let deadline = Instant::now() + config.ping_interval / 2;
        self.conn.write(&frame, deadline).await.is_ok()
    }
}

async fn send_loop(session: Arc<Session>, mut rx: mpsc::Receiver<Frame>) {
    let write_timeout = session.node.config().write_timeout;
    let mut failed = false;

    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Close { code, reason } => {
                session.conn.close(code, &reason).await;
                return;
            }
            _ if failed => {}
            frame => {
                let deadline = Instant::now() + write_timeout;
                if let Err(err) = session.conn.write(&frame, deadline).await {
                    tracing::debug!(sid = %session.uid, error = %err, "write failed");
                    failed = true;
                    session.disconnect("write failed", CloseCode::Abnormal).await;
                }
            }
        }
    }
    // Every sender dropped without a close frame getting through.
    session.conn.close(CloseCode::Abnormal, "send queue closed").await;
}

async fn ping_loop(session: Arc<Session>, mut closed: watch::Receiver<bool>) {
    let interval = session.node.config().ping_interval;
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = closed.changed() => return,
        }
        if !session.ping().await {
            session.disconnect("ping failed", CloseCode::Abnormal).await;
            return;
        }
    }
}
