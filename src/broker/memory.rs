//! In-process broker: bounded per-stream history and a session cache.
//!
//! The epoch is generated at construction, so a restarted process
//! invalidates every cursor issued by its predecessor. History is trimmed by
//! count on append and by age in a background sweep, which also drops
//! finished sessions past their TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{BroadcastHandler, Broker, HandlerSlot, StreamTracker};
use crate::config::BrokerConfig;
use crate::domain::{RemoteCommand, StreamMessage};
use crate::error::BrokerError;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Entry {
    offset: u64,
    data: String,
    published_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StreamHistory {
    last_offset: u64,
    entries: VecDeque<Entry>,
}

impl StreamHistory {
    /// Offset of the oldest retained entry, or the next offset when empty.
    fn first_offset(&self) -> u64 {
        self.entries
            .front()
            .map_or(self.last_offset + 1, |e| e.offset)
    }
}

#[derive(Debug)]
struct CachedSession {
    state: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct State {
    epoch: String,
    history_limit: usize,
    history_ttl: chrono::Duration,
    sessions_ttl: chrono::Duration,
    tracker: StreamTracker,
    streams: Mutex<HashMap<String, StreamHistory>>,
    sessions: Mutex<HashMap<String, CachedSession>>,
}

impl State {
    /// Records `msg` and returns it with its assigned position.
    fn append(&self, mut msg: StreamMessage) -> StreamMessage {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let history = streams.entry(msg.stream.clone()).or_default();
        history.last_offset += 1;
        history.entries.push_back(Entry {
            offset: history.last_offset,
            data: msg.data.clone(),
            published_at: Utc::now(),
        });
        while history.entries.len() > self.history_limit {
            history.entries.pop_front();
        }
        msg.offset = history.last_offset;
        msg.epoch.clone_from(&self.epoch);
        msg
    }

    fn expire(&self) {
        let now = Utc::now();
        {
            let cutoff = now
                .checked_sub_signed(self.history_ttl)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            for history in streams.values_mut() {
                while history
                    .entries
                    .front()
                    .is_some_and(|e| e.published_at <= cutoff)
                {
                    history.entries.pop_front();
                }
            }
            // Keep the offset counter of followed streams so cursors stay valid.
            streams.retain(|stream, history| {
                !history.entries.is_empty() || self.tracker.has(stream)
            });
        }

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, s| s.expires_at.is_none_or(|at| at > now));
    }

    fn message(&self, stream: &str, entry: &Entry) -> StreamMessage {
        StreamMessage {
            stream: stream.to_string(),
            data: entry.data.clone(),
            offset: entry.offset,
            epoch: self.epoch.clone(),
        }
    }
}

/// In-memory [`Broker`] for single-node deployments.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Arc<State>,
    handler: HandlerSlot,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBroker {
    /// Creates a broker with a fresh epoch.
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let epoch = uuid::Uuid::new_v4().simple().to_string();
        Self {
            state: Arc::new(State {
                epoch: epoch.chars().take(8).collect(),
                history_limit: config.history_limit,
                history_ttl: to_chrono(config.history_ttl),
                sessions_ttl: to_chrono(config.sessions_ttl),
                tracker: StreamTracker::default(),
                streams: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
            handler: HandlerSlot::default(),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Current epoch.
    #[must_use]
    pub fn epoch(&self) -> &str {
        &self.state.epoch
    }

    /// Drops history entries and finished sessions older than their TTL.
    ///
    /// Runs every second once the broker is started.
    pub fn expire(&self) {
        self.state.expire();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn announce(&self) -> String {
        format!(
            "memory broker (epoch: {}, history limit: {}, history ttl: {}s, sessions ttl: {}s)",
            self.state.epoch,
            self.state.history_limit,
            self.state.history_ttl.num_seconds(),
            self.state.sessions_ttl.num_seconds()
        )
    }

    async fn start(&self, handler: Arc<dyn BroadcastHandler>) -> Result<(), BrokerError> {
        self.handler.install(handler);

        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            let state = Arc::clone(&self.state);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            *sweeper = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => state.expire(),
                        _ = shutdown_rx.changed() => break,
                    }
                }
                tracing::debug!("memory broker sweeper stopped");
            }));
        }
        Ok(())
    }

    async fn shutdown(&self, deadline: Instant) -> Result<(), BrokerError> {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && tokio::time::timeout_at(deadline, handle).await.is_err()
        {
            return Err(BrokerError::ShutdownTimeout);
        }
        Ok(())
    }

    fn subscribe(&self, stream: &str) -> String {
        self.state.tracker.add(stream)
    }

    fn unsubscribe(&self, stream: &str) -> String {
        self.state.tracker.remove(stream)
    }

    async fn handle_broadcast(&self, msg: StreamMessage) {
        let msg = self.state.append(msg);
        self.handler.broadcast(msg).await;
    }

    async fn handle_command(&self, cmd: RemoteCommand) {
        self.handler.execute(cmd).await;
    }

    async fn history_from(
        &self,
        stream: &str,
        epoch: &str,
        offset: u64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        if epoch != self.state.epoch {
            return Err(BrokerError::history_unavailable(stream, "epoch mismatch"));
        }
        let streams = self
            .state
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(history) = streams.get(stream) else {
            return Err(BrokerError::history_unavailable(stream, "unknown stream"));
        };
        if offset > history.last_offset {
            return Err(BrokerError::history_unavailable(
                stream,
                "offset is ahead of the stream",
            ));
        }
        if offset + 1 < history.first_offset() {
            return Err(BrokerError::history_unavailable(stream, "offset was evicted"));
        }
        Ok(history
            .entries
            .iter()
            .filter(|e| e.offset > offset)
            .map(|e| self.state.message(stream, e))
            .collect())
    }

    async fn history_since(
        &self,
        stream: &str,
        since: i64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let streams = self
            .state
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(stream)
            .map(|history| {
                history
                    .entries
                    .iter()
                    .filter(|e| e.published_at.timestamp() >= since)
                    .map(|e| self.state.message(stream, e))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit_session(&self, sid: &str, state: &[u8]) -> Result<(), BrokerError> {
        self.state
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                sid.to_string(),
                CachedSession {
                    state: state.to_vec(),
                    expires_at: None,
                },
            );
        Ok(())
    }

    async fn restore_session(&self, sid: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let now = Utc::now();
        let sessions = self
            .state
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(sessions
            .get(sid)
            .filter(|s| s.expires_at.is_none_or(|at| at > now))
            .map(|s| s.state.clone()))
    }

    async fn finish_session(&self, sid: &str) -> Result<(), BrokerError> {
        let expires_at = Utc::now()
            .checked_add_signed(self.state.sessions_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Some(session) = self
            .state
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(sid)
        {
            session.expires_at = Some(expires_at);
        }
        Ok(())
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn broker(limit: usize) -> MemoryBroker {
        MemoryBroker::new(&BrokerConfig {
            history_limit: limit,
            ..BrokerConfig::default()
        })
    }

    #[tokio::test]
    async fn history_from_returns_only_later_offsets() {
        let broker = broker(10);
        for i in 1..=5 {
            broker
                .handle_broadcast(StreamMessage::new("room:1", format!("m{i}")))
                .await;
        }

        let Ok(msgs) = broker.history_from("room:1", broker.epoch(), 3).await else {
            panic!("history should be available");
        };
        let offsets: Vec<u64> = msgs.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![4, 5]);
        assert!(msgs.iter().all(|m| m.epoch == broker.epoch()));

        let Ok(msgs) = broker.history_from("room:1", broker.epoch(), 5).await else {
            panic!("caught-up cursor is valid");
        };
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn foreign_epoch_is_unavailable_not_empty() {
        let broker = broker(10);
        broker
            .handle_broadcast(StreamMessage::new("room:1", "m1"))
            .await;

        let res = broker.history_from("room:1", "stale", 0).await;
        assert!(matches!(res, Err(BrokerError::HistoryUnavailable { .. })));
    }

    #[tokio::test]
    async fn evicted_offset_is_unavailable() {
        let broker = broker(2);
        for i in 1..=5 {
            broker
                .handle_broadcast(StreamMessage::new("room:1", format!("m{i}")))
                .await;
        }

        // Offsets 4 and 5 are retained: resuming from 3 has no gap, from 2 has.
        assert!(broker.history_from("room:1", broker.epoch(), 3).await.is_ok());
        let res = broker.history_from("room:1", broker.epoch(), 2).await;
        assert!(matches!(res, Err(BrokerError::HistoryUnavailable { .. })));
    }

    #[tokio::test]
    async fn history_since_filters_by_time() {
        let broker = broker(10);
        broker
            .handle_broadcast(StreamMessage::new("room:1", "m1"))
            .await;

        let past = Utc::now().timestamp() - 60;
        let future = Utc::now().timestamp() + 60;
        assert_eq!(
            broker.history_since("room:1", past).await.map(|m| m.len()),
            Ok(1)
        );
        assert_eq!(
            broker.history_since("room:1", future).await.map(|m| m.len()),
            Ok(0)
        );
        assert_eq!(
            broker.history_since("nope", past).await.map(|m| m.len()),
            Ok(0)
        );
    }

    #[tokio::test]
    async fn sessions_round_trip_and_expire_after_finish() {
        let broker = MemoryBroker::new(&BrokerConfig {
            sessions_ttl: Duration::ZERO,
            ..BrokerConfig::default()
        });

        assert_eq!(broker.restore_session("unknown").await, Ok(None));

        let _ = broker.commit_session("s1", b"state").await;
        assert_eq!(
            broker.restore_session("s1").await,
            Ok(Some(b"state".to_vec()))
        );

        let _ = broker.finish_session("s1").await;
        broker.expire();
        assert_eq!(broker.restore_session("s1").await, Ok(None));
    }

    #[tokio::test]
    async fn expire_drops_old_history() {
        let broker = MemoryBroker::new(&BrokerConfig {
            history_ttl: Duration::ZERO,
            ..BrokerConfig::default()
        });
        broker
            .handle_broadcast(StreamMessage::new("room:1", "m1"))
            .await;
        broker.expire();

        let res = broker.history_from("room:1", broker.epoch(), 0).await;
        assert!(matches!(res, Err(BrokerError::HistoryUnavailable { .. })));
    }

    #[tokio::test]
    async fn shutdown_stops_sweeper() {
        let broker = broker(10);
        let handler: Arc<dyn BroadcastHandler> = Arc::new(crate::testing::RecordingHandler::default());
        assert_eq!(broker.start(handler).await, Ok(()));
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(broker.shutdown(deadline).await, Ok(()));
    }
}
