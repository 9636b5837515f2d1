//! Fan-out-only broker: no history, no session persistence.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{BroadcastHandler, Broker, HandlerSlot, StreamTracker};
use crate::domain::{RemoteCommand, StreamMessage};
use crate::error::BrokerError;

/// Passes backplane messages straight through to the handler.
#[derive(Debug, Default)]
pub struct NoopBroker {
    tracker: StreamTracker,
    handler: HandlerSlot,
}

impl NoopBroker {
    /// Creates the broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for NoopBroker {
    fn announce(&self) -> String {
        "noop broker (no history, no session restore)".to_string()
    }

    async fn start(&self, handler: Arc<dyn BroadcastHandler>) -> Result<(), BrokerError> {
        self.handler.install(handler);
        Ok(())
    }

    async fn shutdown(&self, _deadline: Instant) -> Result<(), BrokerError> {
        Ok(())
    }

    fn subscribe(&self, stream: &str) -> String {
        self.tracker.add(stream)
    }

    fn unsubscribe(&self, stream: &str) -> String {
        self.tracker.remove(stream)
    }

    async fn handle_broadcast(&self, msg: StreamMessage) {
        self.handler.broadcast(msg).await;
    }

    async fn handle_command(&self, cmd: RemoteCommand) {
        self.handler.execute(cmd).await;
    }

    async fn history_from(
        &self,
        _stream: &str,
        _epoch: &str,
        _offset: u64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        Err(BrokerError::NotSupported("history"))
    }

    async fn history_since(
        &self,
        _stream: &str,
        _since: i64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        Err(BrokerError::NotSupported("history"))
    }

    async fn commit_session(&self, _sid: &str, _state: &[u8]) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn restore_session(&self, _sid: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        Ok(None)
    }

    async fn finish_session(&self, _sid: &str) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_is_not_supported() {
        let broker = NoopBroker::new();
        assert_eq!(
            broker.history_from("room:1", "e", 1).await,
            Err(BrokerError::NotSupported("history"))
        );
        assert_eq!(broker.restore_session("s").await, Ok(None));
    }
}
