//! Broker contract: backplane fan-in, stream history and session
//! continuity.
//!
//! The node owns one `Arc<dyn Broker>`. Backplane messages enter through
//! [`Broker::handle_broadcast`] / [`Broker::handle_command`]; the broker
//! records whatever it persists and forwards to the [`BroadcastHandler`]
//! handed to it by [`Broker::start`] (the Hub).

pub mod memory;
pub mod noop;
pub mod postgres;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{RemoteCommand, StreamMessage};
use crate::error::BrokerError;

pub use memory::MemoryBroker;
pub use noop::NoopBroker;
pub use postgres::PostgresBroker;

/// Receiver of messages the broker lets through to local fan-out.
#[async_trait]
pub trait BroadcastHandler: Send + Sync + fmt::Debug {
    /// Fans a stream message out to local subscribers.
    async fn broadcast(&self, msg: StreamMessage);

    /// Applies an out-of-band control message.
    async fn execute_remote_command(&self, cmd: RemoteCommand);
}

/// Pluggable backplane/history/session backend.
#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug {
    /// Human-readable identity of the backend.
    fn announce(&self) -> String;

    /// Starts background work and installs the fan-out handler.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the backend cannot be reached.
    async fn start(&self, handler: Arc<dyn BroadcastHandler>) -> Result<(), BrokerError>;

    /// Stops background work, giving up at `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ShutdownTimeout`] if cleanup did not finish in
    /// time.
    async fn shutdown(&self, deadline: Instant) -> Result<(), BrokerError>;

    /// Registers local interest in `stream`; returns a backend token.
    fn subscribe(&self, stream: &str) -> String;

    /// Drops local interest in `stream`; returns a backend token.
    fn unsubscribe(&self, stream: &str) -> String;

    /// Accepts a backplane broadcast.
    async fn handle_broadcast(&self, msg: StreamMessage);

    /// Accepts a backplane control message.
    async fn handle_command(&self, cmd: RemoteCommand);

    /// Messages of `stream` after `offset` within `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::HistoryUnavailable`] when the position cannot
    /// be served without a gap (different epoch, evicted offset).
    async fn history_from(
        &self,
        stream: &str,
        epoch: &str,
        offset: u64,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Messages of `stream` published at or after `since` (Unix seconds).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if history is not supported or storage fails.
    async fn history_since(
        &self,
        stream: &str,
        since: i64,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Stores the serialized state of session `sid`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Persistence`] on storage failure.
    async fn commit_session(&self, sid: &str, state: &[u8]) -> Result<(), BrokerError>;

    /// Loads the state of session `sid`; `None` when unknown or expired.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Persistence`] on storage failure.
    async fn restore_session(&self, sid: &str) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Marks session `sid` as finished; it stays restorable until its TTL.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Persistence`] on storage failure.
    async fn finish_session(&self, sid: &str) -> Result<(), BrokerError>;
}

/// Reference counts of local stream interest.
///
/// The token returned by `subscribe`/`unsubscribe` is the stream name when
/// interest appears or disappears, empty otherwise.
#[derive(Debug, Default)]
pub struct StreamTracker {
    counts: Mutex<HashMap<String, usize>>,
}

impl StreamTracker {
    /// Adds one subscriber; returns the stream on 0 → 1.
    pub fn add(&self, stream: &str) -> String {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(stream.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            stream.to_string()
        } else {
            String::new()
        }
    }

    /// Removes one subscriber; returns the stream on 1 → 0.
    pub fn remove(&self, stream: &str) -> String {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match counts.get_mut(stream) {
            Some(count) if *count > 1 => {
                *count -= 1;
                String::new()
            }
            Some(_) => {
                counts.remove(stream);
                stream.to_string()
            }
            None => String::new(),
        }
    }

    /// Returns `true` if any local session follows `stream`.
    pub fn has(&self, stream: &str) -> bool {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(stream)
    }
}

/// Write-once slot for the fan-out handler.
#[derive(Debug, Default)]
pub(crate) struct HandlerSlot(OnceLock<Arc<dyn BroadcastHandler>>);

impl HandlerSlot {
    pub(crate) fn install(&self, handler: Arc<dyn BroadcastHandler>) {
        if self.0.set(handler).is_err() {
            tracing::warn!("broker handler already installed; ignoring");
        }
    }

    pub(crate) async fn broadcast(&self, msg: StreamMessage) {
        match self.0.get() {
            Some(handler) => handler.broadcast(msg).await,
            None => tracing::warn!(stream = %msg.stream, "broker not started; dropping broadcast"),
        }
    }

    pub(crate) async fn execute(&self, cmd: RemoteCommand) {
        match self.0.get() {
            Some(handler) => handler.execute_remote_command(cmd).await,
            None => tracing::warn!(?cmd, "broker not started; dropping remote command"),
        }
    }
}
