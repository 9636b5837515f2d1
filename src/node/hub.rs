//! Stream registry and fan-out actor.
//!
//! All registry state is owned by one task and only reached through
//! [`HubHandle`]. The task never awaits on a session: delivery goes
//! through the non-blocking [`Session::send`], and any disconnect it
//! triggers runs on a task of its own.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use super::session::Session;
use crate::broker::{BroadcastHandler, Broker};
use crate::domain::{RemoteCommand, RemoteDisconnect, Reply, StreamMessage};
use crate::error::GatewayError;

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct HubStats {
    /// Registered sessions.
    pub sessions: usize,
    /// Streams with at least one subscriber.
    pub streams: usize,
}

/// A `(stream, channel identifier)` link of one session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamLink {
    /// Stream name.
    pub stream: String,
    /// Channel identifier the stream is attached to.
    pub identifier: String,
}

#[derive(Debug)]
enum HubCommand {
    Register(Arc<Session>),
    Unregister(String),
    Subscribe {
        sid: String,
        stream: String,
        identifier: String,
    },
    /// An empty identifier drops every stream of the session.
    Unsubscribe {
        sid: String,
        identifier: String,
    },
    Broadcast(StreamMessage),
    RemoteDisconnect(RemoteDisconnect),
    Stats(oneshot::Sender<HubStats>),
    StreamsFor(String, oneshot::Sender<Vec<StreamLink>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle submitting commands to the Hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Spawns the Hub task with a command buffer of `buffer` entries.
    #[must_use]
    pub fn spawn(buffer: usize, broker: Arc<dyn Broker>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let hub = Hub {
            broker,
            sessions: HashMap::new(),
            streams: HashMap::new(),
            links: HashMap::new(),
        };
        (Self { tx }, tokio::spawn(hub.run(rx)))
    }

    async fn submit(&self, cmd: HubCommand) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!("hub stopped; command dropped");
        }
    }

    /// Adds a session to the registry.
    pub async fn register(&self, session: Arc<Session>) {
        self.submit(HubCommand::Register(session)).await;
    }

    /// Removes a session and every stream link it holds.
    pub async fn unregister(&self, sid: &str) {
        self.submit(HubCommand::Unregister(sid.to_string())).await;
    }

    /// Links `stream` to `identifier` of session `sid`. Idempotent.
    pub async fn subscribe(&self, sid: &str, stream: &str, identifier: &str) {
        self.submit(HubCommand::Subscribe {
            sid: sid.to_string(),
            stream: stream.to_string(),
            identifier: identifier.to_string(),
        })
        .await;
    }

    /// Drops every stream linked to `identifier` of session `sid`, or every
    /// stream of the session when `identifier` is empty.
    pub async fn unsubscribe(&self, sid: &str, identifier: &str) {
        self.submit(HubCommand::Unsubscribe {
            sid: sid.to_string(),
            identifier: identifier.to_string(),
        })
        .await;
    }

    /// Fans `msg` out to the subscribers of its stream.
    pub async fn broadcast(&self, msg: StreamMessage) {
        self.submit(HubCommand::Broadcast(msg)).await;
    }

    /// Current registry counters.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Stopped`] once the Hub has shut down.
    pub async fn stats(&self) -> Result<HubStats, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Stats(tx))
            .await
            .map_err(|_| GatewayError::Stopped("hub"))?;
        rx.await.map_err(|_| GatewayError::Stopped("hub"))
    }

    /// Stream links held by session `sid`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Stopped`] once the Hub has shut down.
    pub async fn streams_for(&self, sid: &str) -> Result<Vec<StreamLink>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::StreamsFor(sid.to_string(), tx))
            .await
            .map_err(|_| GatewayError::Stopped("hub"))?;
        rx.await.map_err(|_| GatewayError::Stopped("hub"))
    }

    /// Stops accepting commands and returns once the pending ones are
    /// processed. Registered sessions are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the Hub task died before
    /// acknowledging.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Shutdown(tx)).await.is_err() {
            return Ok(());
        }
        rx.await
            .map_err(|_| GatewayError::Internal("hub task exited before draining".to_string()))
    }
}

#[async_trait]
impl BroadcastHandler for HubHandle {
    async fn broadcast(&self, msg: StreamMessage) {
        Self::broadcast(self, msg).await;
    }

    async fn execute_remote_command(&self, cmd: RemoteCommand) {
        match cmd {
            RemoteCommand::Disconnect(payload) => {
                self.submit(HubCommand::RemoteDisconnect(payload)).await;
            }
        }
    }
}

#[derive(Debug)]
struct Hub {
    broker: Arc<dyn Broker>,
    sessions: HashMap<String, Arc<Session>>,
    /// stream → sid → identifiers
    streams: HashMap<String, HashMap<String, HashSet<String>>>,
    /// sid → identifier → streams
    links: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            if let HubCommand::Shutdown(done) = cmd {
                rx.close();
                while let Some(pending) = rx.recv().await {
                    self.handle(pending);
                }
                tracing::info!(sessions = self.sessions.len(), "hub stopped");
                let _ = done.send(());
                return;
            }
            self.handle(cmd);
        }
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(session) => {
                tracing::debug!(sid = %session.uid(), "session registered");
                self.sessions.insert(session.uid().to_string(), session);
            }
            HubCommand::Unregister(sid) => {
                self.remove_links(&sid, "");
                self.sessions.remove(&sid);
                tracing::debug!(%sid, "session unregistered");
            }
            HubCommand::Subscribe {
                sid,
                stream,
                identifier,
            } => self.add_link(sid, stream, identifier),
            HubCommand::Unsubscribe { sid, identifier } => self.remove_links(&sid, &identifier),
            HubCommand::Broadcast(msg) => self.broadcast(&msg),
            HubCommand::RemoteDisconnect(payload) => self.remote_disconnect(&payload),
            HubCommand::Stats(reply) => {
                let _ = reply.send(HubStats {
                    sessions: self.sessions.len(),
                    streams: self.streams.len(),
                });
            }
            HubCommand::StreamsFor(sid, reply) => {
                let mut links: Vec<StreamLink> = self
                    .links
                    .get(&sid)
                    .into_iter()
                    .flatten()
                    .flat_map(|(identifier, streams)| {
                        streams.iter().map(move |stream| StreamLink {
                            stream: stream.clone(),
                            identifier: identifier.clone(),
                        })
                    })
                    .collect();
                links.sort();
                let _ = reply.send(links);
            }
            HubCommand::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    fn add_link(&mut self, sid: String, stream: String, identifier: String) {
        if !self.sessions.contains_key(&sid) {
            tracing::debug!(%sid, %stream, "subscribe for unregistered session ignored");
            return;
        }

        if !self.streams.contains_key(&stream) {
            let token = self.broker.subscribe(&stream);
            tracing::debug!(%stream, %token, "stream opened");
        }
        self.streams
            .entry(stream.clone())
            .or_default()
            .entry(sid.clone())
            .or_default()
            .insert(identifier.clone());

        self.links
            .entry(sid)
            .or_default()
            .entry(identifier)
            .or_default()
            .insert(stream);
    }

    fn remove_links(&mut self, sid: &str, identifier: &str) {
        let Some(by_identifier) = self.links.get_mut(sid) else {
            return;
        };

        let removed: Vec<(String, HashSet<String>)> = if identifier.is_empty() {
            by_identifier.drain().collect()
        } else {
            by_identifier
                .remove_entry(identifier)
                .into_iter()
                .collect()
        };
        if by_identifier.is_empty() {
            self.links.remove(sid);
        }

        for (identifier, streams) in removed {
            for stream in streams {
                self.unlink(sid, &stream, &identifier);
            }
        }
    }

    fn unlink(&mut self, sid: &str, stream: &str, identifier: &str) {
        let Some(subscribers) = self.streams.get_mut(stream) else {
            return;
        };
        if let Some(identifiers) = subscribers.get_mut(sid) {
            identifiers.remove(identifier);
            if identifiers.is_empty() {
                subscribers.remove(sid);
            }
        }
        if subscribers.is_empty() {
            self.streams.remove(stream);
            let token = self.broker.unsubscribe(stream);
            tracing::debug!(%stream, %token, "stream closed");
        }
    }

    fn broadcast(&self, msg: &StreamMessage) {
        let Some(subscribers) = self.streams.get(&msg.stream) else {
            tracing::debug!(stream = %msg.stream, "no subscribers");
            return;
        };

        for (sid, identifiers) in subscribers {
            let Some(session) = self.sessions.get(sid) else {
                continue;
            };
            for identifier in identifiers {
                let mut reply = Reply::broadcast(identifier, &msg.data);
                if msg.offset > 0 {
                    reply = reply.with_position(&msg.stream, &msg.epoch, msg.offset);
                }
                session.send(&reply.into());
            }
        }
    }

    fn remote_disconnect(&self, payload: &RemoteDisconnect) {
        for session in self.sessions.values() {
            if session.identifiers() != payload.identifier {
                continue;
            }
            tracing::info!(sid = %session.uid(), "remote disconnect");
            let session = Arc::clone(session);
            let reconnect = payload.reconnect;
            tokio::spawn(async move {
                session.disconnect_with_message("remote", reconnect).await;
            });
        }
    }
}
