//! Node core: owns the Hub and the disconnect queue, dispatches client
//! commands to sessions and backplane messages to the broker.
//!
//! ```text
//!  client ──▶ Session::serve ──▶ Node::handle_command ──▶ Session::{subscribe,..}
//!                                                             │
//!                                         Controller ◀────────┤
//!                                                             ▼
//!  backplane ──▶ Node::handle_pubsub ──▶ Broker ──▶ HubHandle ──▶ Session::send
//! ```

pub mod disconnector;
pub mod hub;
pub mod session;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broker::Broker;
use crate::config::NodeConfig;
use crate::controller::Controller;
use crate::domain::{Command, HistoryRequest, PubSubMessage, Reply, SessionSnapshot, StreamMessage};
use crate::error::{BrokerError, GatewayError};

pub use disconnector::{DisconnectEntry, DisconnectQueue};
pub use hub::{HubHandle, HubStats, StreamLink};
pub use session::Session;

/// Process-wide coordinator for sessions, Hub, broker and controller.
#[derive(Debug)]
pub struct Node {
    config: NodeConfig,
    controller: Arc<dyn Controller>,
    broker: Arc<dyn Broker>,
    hub: HubHandle,
    hub_task: Mutex<Option<JoinHandle<()>>>,
    disconnector: DisconnectQueue,
}

impl Node {
    /// Builds the node and spawns its Hub and disconnect worker.
    ///
    /// The broker is not started; call [`Node::start`] before accepting
    /// backplane traffic.
    #[must_use]
    pub fn new(
        config: NodeConfig,
        controller: Arc<dyn Controller>,
        broker: Arc<dyn Broker>,
    ) -> Arc<Self> {
        let (hub, hub_task) = HubHandle::spawn(config.hub_buffer, Arc::clone(&broker));
        let disconnector = DisconnectQueue::spawn(
            Arc::clone(&controller),
            config.disconnect_rate,
            config.disconnect_queue_capacity,
        );
        Arc::new(Self {
            config,
            controller,
            broker,
            hub,
            hub_task: Mutex::new(Some(hub_task)),
            disconnector,
        })
    }

    /// Starts the broker with the Hub as its fan-out target.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Broker`] if the broker fails to start.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.broker.start(Arc::new(self.hub.clone())).await?;
        tracing::info!(broker = %self.broker.announce(), "node started");
        Ok(())
    }

    /// Node settings.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Business-logic controller.
    #[must_use]
    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    /// Active broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Handle to the Hub.
    #[must_use]
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Controller disconnect notifications not yet delivered.
    #[must_use]
    pub fn pending_disconnects(&self) -> usize {
        self.disconnector.pending()
    }

    /// Authenticates `session`, or restores it when the client presents a
    /// known session id, and registers it with the Hub.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Controller`] if the controller rejects the
    /// connection and [`GatewayError::SessionClosed`] if the session closed
    /// while authenticating. The caller tears the session down.
    pub async fn authenticate(&self, session: &Arc<Session>) -> Result<(), GatewayError> {
        if let Some(prev) = session.env().restore_sid()
            && self.restore(session, prev).await?
        {
            return Ok(());
        }

        let res = self
            .controller
            .authenticate(session.uid(), session.env())
            .await
            .inspect_err(|err| {
                tracing::warn!(sid = %session.uid(), error = %err, "authentication failed");
            })?;

        session.set_identifiers(res.identifiers);
        if !session.mark_connected() {
            return Err(GatewayError::SessionClosed(session.uid().to_string()));
        }
        self.hub.register(Arc::clone(session)).await;
        for raw in &res.transmissions {
            session.transmit(raw);
        }
        self.commit_session(session).await;

        tracing::info!(sid = %session.uid(), path = %session.env().path, "session connected");
        Ok(())
    }

    /// Returns `Ok(false)` when there is nothing to restore.
    async fn restore(&self, session: &Arc<Session>, prev: &str) -> Result<bool, GatewayError> {
        let state = match self.broker.restore_session(prev).await {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(false),
            Err(err) => {
                tracing::warn!(sid = %session.uid(), prev, error = %err, "session restore failed");
                return Ok(false);
            }
        };
        let snapshot = match SessionSnapshot::from_bytes(&state) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(sid = %session.uid(), prev, error = %err, "corrupt session snapshot");
                return Ok(false);
            }
        };

        session.set_identifiers(snapshot.identifiers);
        if !session.mark_connected() {
            return Err(GatewayError::SessionClosed(session.uid().to_string()));
        }
        self.hub.register(Arc::clone(session)).await;
        session.restore_subscriptions(snapshot.subscriptions).await;
        session.send(
            &Reply {
                sid: Some(session.uid().to_string()),
                restored: true,
                ..Reply::typed("welcome", "")
            }
            .into(),
        );
        self.commit_session(session).await;

        tracing::info!(sid = %session.uid(), prev, "session restored");
        Ok(true)
    }

    /// Decodes one client message and dispatches it. Malformed and unknown
    /// commands are logged and dropped.
    pub async fn handle_command(&self, session: &Arc<Session>, raw: &[u8]) {
        let cmd = match session.decode(raw) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(sid = %session.uid(), error = %err, "malformed client message");
                return;
            }
        };

        match cmd {
            Command::Subscribe { identifier } => session.subscribe(&identifier).await,
            Command::Unsubscribe { identifier } => session.unsubscribe(&identifier).await,
            Command::Perform { identifier, data } => session.perform(&identifier, &data).await,
            Command::History {
                identifier,
                request,
            } => self.history(session, &identifier, &request).await,
            Command::Unknown(name) => {
                tracing::warn!(sid = %session.uid(), command = %name, "unknown command");
            }
        }
    }

    /// Replays missed messages of every stream attached to `identifier`.
    pub async fn history(&self, session: &Arc<Session>, identifier: &str, request: &HistoryRequest) {
        let Some(streams) = session.streams_of(identifier).await else {
            tracing::warn!(sid = %session.uid(), identifier, "history for unknown subscription");
            return;
        };

        let mut backlog = Vec::new();
        for stream in &streams {
            match self.stream_history(stream, request).await {
                Ok(messages) => backlog.extend(messages),
                Err(err) => {
                    tracing::warn!(sid = %session.uid(), identifier, %stream, error = %err, "history rejected");
                    session.send(&Reply::typed("reject_history", identifier).into());
                    return;
                }
            }
        }

        tracing::debug!(sid = %session.uid(), identifier, messages = backlog.len(), "replaying history");
        for msg in backlog {
            let reply = Reply::broadcast(identifier, &msg.data)
                .with_position(&msg.stream, &msg.epoch, msg.offset);
            if !session.send_paced(&reply.into()).await {
                return;
            }
        }
        session
            .send_paced(&Reply::typed("confirm_history", identifier).into())
            .await;
    }

    async fn stream_history(
        &self,
        stream: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        match (request.streams.get(stream), request.since) {
            (Some(pos), since) => {
                let res = self.broker.history_from(stream, &pos.epoch, pos.offset).await;
                match (res, since) {
                    (Err(BrokerError::HistoryUnavailable { .. }), Some(since)) => {
                        self.broker.history_since(stream, since).await
                    }
                    (res, _) => res,
                }
            }
            (None, Some(since)) => self.broker.history_since(stream, since).await,
            (None, None) => Ok(Vec::new()),
        }
    }

    /// Accepts a raw backplane message (`{stream, data}` or a remote
    /// command) and hands it to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if `raw` is neither.
    pub async fn handle_pubsub(&self, raw: &[u8]) -> Result<(), GatewayError> {
        let msg: PubSubMessage = serde_json::from_slice(raw)
            .map_err(|err| GatewayError::InvalidRequest(format!("malformed pub/sub message: {err}")))?;
        match msg {
            PubSubMessage::Broadcast(msg) => {
                tracing::debug!(stream = %msg.stream, "backplane broadcast");
                self.broker.handle_broadcast(msg).await;
            }
            PubSubMessage::Command(cmd) => {
                tracing::debug!(?cmd, "backplane command");
                self.broker.handle_command(cmd).await;
            }
        }
        Ok(())
    }

    /// Unregisters a stopped session, schedules the controller notification
    /// and starts its restore window. Called once per session.
    pub(crate) async fn disconnect(&self, session: &Arc<Session>) {
        self.hub.unregister(session.uid()).await;
        self.disconnector.enqueue(DisconnectEntry {
            sid: session.uid().to_string(),
            identifiers: session.identifiers(),
            subscriptions: session.subscriptions().await,
            env: session.env().clone(),
        });
        if let Err(err) = self.broker.finish_session(session.uid()).await {
            tracing::warn!(sid = %session.uid(), error = %err, "failed to finish session");
        }
        tracing::info!(sid = %session.uid(), "session disconnected");
    }

    /// Stores the session snapshot so a reconnecting client can restore it.
    pub(crate) async fn commit_session(&self, session: &Session) {
        if !session.is_connected() {
            return;
        }
        let snapshot = session.snapshot().await;
        let state = match snapshot.to_bytes() {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(sid = %session.uid(), error = %err, "failed to encode session");
                return;
            }
        };
        if let Err(err) = self.broker.commit_session(session.uid(), &state).await {
            tracing::warn!(sid = %session.uid(), error = %err, "failed to commit session");
        }
    }

    /// Stops the broker, the Hub, the disconnect queue and the controller,
    /// in that order. Every stage runs even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Shutdown`] listing every failed stage.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        let mut errors = Vec::new();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        if let Err(err) = self.broker.shutdown(deadline).await {
            tracing::error!(error = %err, "broker shutdown failed");
            errors.push(format!("broker: {err}"));
        }

        if let Err(err) = self.hub.shutdown().await {
            tracing::error!(error = %err, "hub shutdown failed");
            errors.push(format!("hub: {err}"));
        }
        let hub_task = self
            .hub_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = hub_task
            && let Err(err) = task.await
        {
            errors.push(format!("hub: {err}"));
        }

        if let Err(err) = self.disconnector.shutdown(self.config.disconnect_timeout).await {
            tracing::error!(error = %err, "disconnect queue shutdown failed");
            errors.push(format!("disconnector: {err}"));
        }

        if let Err(err) = self.controller.shutdown().await {
            tracing::error!(error = %err, "controller shutdown failed");
            errors.push(format!("controller: {err}"));
        }

        if errors.is_empty() {
            tracing::info!("node stopped");
            Ok(())
        } else {
            Err(GatewayError::Shutdown(errors))
        }
    }
}
