//! Rate-limited controller disconnect notifications.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::controller::Controller;
use crate::domain::SessionEnv;
use crate::error::GatewayError;

/// Session state captured at disconnect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEntry {
    /// Session id.
    pub sid: String,
    /// Connection identifiers.
    pub identifiers: String,
    /// Channel identifiers the session was subscribed to.
    pub subscriptions: Vec<String>,
    /// Request path and headers.
    pub env: SessionEnv,
}

/// FIFO of pending controller notifications drained by one worker at a
/// bounded rate.
///
/// Enqueueing never waits: when the backlog is full the entry is dropped
/// and logged.
#[derive(Debug)]
pub struct DisconnectQueue {
    tx: Mutex<Option<mpsc::Sender<DisconnectEntry>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    draining: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
}

impl DisconnectQueue {
    /// Spawns the worker, allowing `rate` notifications per second.
    #[must_use]
    pub fn spawn(controller: Arc<dyn Controller>, rate: u32, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let draining = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run(
            controller,
            rx,
            Duration::from_secs(1) / rate.max(1),
            Arc::clone(&draining),
            Arc::clone(&pending),
        ));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            draining,
            pending,
        }
    }

    /// Queues a notification. Returns `false` if it was dropped.
    pub fn enqueue(&self, entry: DisconnectEntry) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            tracing::warn!(sid = %entry.sid, "disconnect queue is shut down; notification dropped");
            return false;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry) | mpsc::error::TrySendError::Closed(entry)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(sid = %entry.sid, "disconnect queue full; notification dropped");
                false
            }
        }
    }

    /// Notifications not yet delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stops accepting entries and drains the backlog without pacing,
    /// abandoning whatever is left after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if entries were abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), GatewayError> {
        self.draining.store(true, Ordering::SeqCst);
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut worker) = worker else {
            return Ok(());
        };

        if tokio::time::timeout(timeout, &mut worker).await.is_ok() {
            return Ok(());
        }
        worker.abort();
        let abandoned = self.pending.swap(0, Ordering::SeqCst);
        tracing::warn!(abandoned, "disconnect queue drain timed out");
        Err(GatewayError::Internal(format!(
            "disconnect queue abandoned {abandoned} notifications"
        )))
    }
}

async fn run(
    controller: Arc<dyn Controller>,
    mut rx: mpsc::Receiver<DisconnectEntry>,
    period: Duration,
    draining: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while let Some(entry) = rx.recv().await {
        if !draining.load(Ordering::SeqCst) {
            ticker.tick().await;
        }
        tracing::debug!(sid = %entry.sid, subscriptions = ?entry.subscriptions, "notifying controller of disconnect");
        if let Err(err) = controller
            .disconnect(
                &entry.sid,
                &entry.identifiers,
                &entry.subscriptions,
                &entry.env,
            )
            .await
        {
            tracing::error!(sid = %entry.sid, error = %err, "controller disconnect failed");
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!("disconnect queue drained");
}
