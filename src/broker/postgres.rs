//! PostgreSQL-backed broker: history and sessions survive restarts.
//!
//! The epoch is created once and stored in the database, so cursors stay
//! valid across process restarts and only change when the tables are
//! wiped.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{BroadcastHandler, Broker, HandlerSlot, StreamTracker};
use crate::config::BrokerConfig;
use crate::domain::{RemoteCommand, StreamMessage};
use crate::error::BrokerError;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS broker_epoch (\
        id SMALLINT PRIMARY KEY, \
        epoch TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS stream_offsets (\
        stream TEXT PRIMARY KEY, \
        last_offset BIGINT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS stream_history (\
        stream TEXT NOT NULL, \
        position BIGINT NOT NULL, \
        data TEXT NOT NULL, \
        published_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
        PRIMARY KEY (stream, position))",
    "CREATE TABLE IF NOT EXISTS broker_sessions (\
        sid TEXT PRIMARY KEY, \
        state BYTEA NOT NULL, \
        expires_at TIMESTAMPTZ)",
];

/// [`Broker`] storing history and sessions in PostgreSQL via `sqlx::PgPool`.
#[derive(Debug)]
pub struct PostgresBroker {
    pool: PgPool,
    epoch: OnceLock<String>,
    history_limit: i64,
    history_ttl: chrono::Duration,
    sessions_ttl: chrono::Duration,
    tracker: StreamTracker,
    handler: HandlerSlot,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresBroker {
    /// Connects, creates the schema if needed and loads the epoch.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Persistence`] if the database is unreachable
    /// or the schema cannot be created.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
            .connect(&config.database_url)
            .await?;

        let broker = Self::with_pool(pool, config);
        broker.migrate().await?;
        Ok(broker)
    }

    /// Wraps an existing pool. Call [`Self::migrate`] before use.
    #[must_use]
    pub fn with_pool(pool: PgPool, config: &BrokerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pool,
            epoch: OnceLock::new(),
            history_limit: i64::try_from(config.history_limit).unwrap_or(i64::MAX),
            history_ttl: chrono::Duration::from_std(config.history_ttl)
                .unwrap_or(chrono::Duration::MAX),
            sessions_ttl: chrono::Duration::from_std(config.sessions_ttl)
                .unwrap_or(chrono::Duration::MAX),
            tracker: StreamTracker::default(),
            handler: HandlerSlot::default(),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Creates missing tables and loads (or creates) the stored epoch.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Persistence`] on database failure.
    pub async fn migrate(&self) -> Result<(), BrokerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        let candidate: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        sqlx::query(
            "INSERT INTO broker_epoch (id, epoch) VALUES (1, $1) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&candidate)
        .execute(&self.pool)
        .await?;
        let epoch = sqlx::query_scalar::<_, String>("SELECT epoch FROM broker_epoch WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(%epoch, "postgres broker schema ready");
        let _ = self.epoch.set(epoch);
        Ok(())
    }

    fn epoch(&self) -> &str {
        self.epoch.get().map_or("", String::as_str)
    }

    /// Stores `msg` and returns it with its assigned position.
    async fn append(&self, mut msg: StreamMessage) -> Result<StreamMessage, BrokerError> {
        let mut tx = self.pool.begin().await?;

        let offset = sqlx::query_scalar::<_, i64>(
            "INSERT INTO stream_offsets (stream, last_offset) VALUES ($1, 1) \
             ON CONFLICT (stream) DO UPDATE SET last_offset = stream_offsets.last_offset + 1 \
             RETURNING last_offset",
        )
        .bind(&msg.stream)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO stream_history (stream, position, data) VALUES ($1, $2, $3)")
            .bind(&msg.stream)
            .bind(offset)
            .bind(&msg.data)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM stream_history WHERE stream = $1 AND position <= $2")
            .bind(&msg.stream)
            .bind(offset.saturating_sub(self.history_limit))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        msg.offset = from_db(offset);
        msg.epoch = self.epoch().to_string();
        Ok(msg)
    }

    async fn sweep(pool: &PgPool, history_ttl: chrono::Duration) -> Result<(), BrokerError> {
        let cutoff = Utc::now()
            .checked_sub_signed(history_ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        sqlx::query("DELETE FROM stream_history WHERE published_at <= $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM broker_sessions WHERE expires_at IS NOT NULL AND expires_at <= now()")
            .execute(pool)
            .await?;
        Ok(())
    }

    fn messages(&self, stream: &str, rows: Vec<(i64, String)>) -> Vec<StreamMessage> {
        rows.into_iter()
            .map(|(position, data)| StreamMessage {
                stream: stream.to_string(),
                data,
                offset: from_db(position),
                epoch: self.epoch().to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    fn announce(&self) -> String {
        format!(
            "postgres broker (epoch: {}, history limit: {}, history ttl: {}s, sessions ttl: {}s)",
            self.epoch(),
            self.history_limit,
            self.history_ttl.num_seconds(),
            self.sessions_ttl.num_seconds()
        )
    }

    async fn start(&self, handler: Arc<dyn BroadcastHandler>) -> Result<(), BrokerError> {
        if self.epoch.get().is_none() {
            self.migrate().await?;
        }
        self.handler.install(handler);

        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            let pool = self.pool.clone();
            let ttl = self.history_ttl;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            *sweeper = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = Self::sweep(&pool, ttl).await {
                                tracing::warn!(%err, "postgres broker sweep failed");
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
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
        tokio::time::timeout_at(deadline, self.pool.close())
            .await
            .map_err(|_| BrokerError::ShutdownTimeout)
    }

    fn subscribe(&self, stream: &str) -> String {
        self.tracker.add(stream)
    }

    fn unsubscribe(&self, stream: &str) -> String {
        self.tracker.remove(stream)
    }

    async fn handle_broadcast(&self, msg: StreamMessage) {
        let msg = match self.append(msg.clone()).await {
            Ok(positioned) => positioned,
            Err(err) => {
                tracing::error!(stream = %msg.stream, %err, "failed to record history");
                msg
            }
        };
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
        if epoch != self.epoch() {
            return Err(BrokerError::history_unavailable(stream, "epoch mismatch"));
        }
        let offset = to_db(offset);

        let last = sqlx::query_scalar::<_, i64>(
            "SELECT last_offset FROM stream_offsets WHERE stream = $1",
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await?;
        let Some(last) = last else {
            return Err(BrokerError::history_unavailable(stream, "unknown stream"));
        };
        if offset > last {
            return Err(BrokerError::history_unavailable(
                stream,
                "offset is ahead of the stream",
            ));
        }

        let first = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(position) FROM stream_history WHERE stream = $1",
        )
        .bind(stream)
        .fetch_one(&self.pool)
        .await?
        .unwrap_or(last + 1);
        if offset + 1 < first {
            return Err(BrokerError::history_unavailable(stream, "offset was evicted"));
        }

        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT position, data FROM stream_history \
             WHERE stream = $1 AND position > $2 ORDER BY position ASC",
        )
        .bind(stream)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.messages(stream, rows))
    }

    async fn history_since(
        &self,
        stream: &str,
        since: i64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let since = since_timestamp(stream, since)?;
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT position, data FROM stream_history \
             WHERE stream = $1 AND published_at >= $2 ORDER BY position ASC",
        )
        .bind(stream)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.messages(stream, rows))
    }

    async fn commit_session(&self, sid: &str, state: &[u8]) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO broker_sessions (sid, state, expires_at) VALUES ($1, $2, NULL) \
             ON CONFLICT (sid) DO UPDATE SET state = EXCLUDED.state, expires_at = NULL",
        )
        .bind(sid)
        .bind(state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn restore_session(&self, sid: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let state = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT state FROM broker_sessions \
             WHERE sid = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(sid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn finish_session(&self, sid: &str) -> Result<(), BrokerError> {
        sqlx::query("UPDATE broker_sessions SET expires_at = $2 WHERE sid = $1")
            .bind(sid)
            .bind(
                Utc::now()
                    .checked_add_signed(self.sessions_ttl)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn to_db(offset: u64) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

fn from_db(position: i64) -> u64 {
    u64::try_from(position).unwrap_or(0)
}

fn since_timestamp(stream: &str, since: i64) -> Result<DateTime<Utc>, BrokerError> {
    DateTime::<Utc>::from_timestamp(since, 0).ok_or_else(|| {
        BrokerError::history_unavailable(stream, format!("timestamp {since} is out of range"))
    })
}
