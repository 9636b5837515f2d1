//! Business-logic controller contract.
//!
//! The node never decides who may connect or which streams a channel maps
//! to; it asks a [`Controller`] and applies the returned [`CommandResult`].

pub mod streams;

use std::fmt;

use async_trait::async_trait;

use crate::domain::SessionEnv;
use crate::error::ControllerError;

pub use streams::PublicStreamsController;

/// Outcome of a successful authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectResult {
    /// Opaque connection identifiers.
    pub identifiers: String,
    /// Raw messages to transmit immediately.
    pub transmissions: Vec<String>,
}

/// Side effects requested by the controller for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Streams to attach to the channel identifier.
    pub streams: Vec<String>,
    /// Detach every stream of the channel identifier first.
    pub stop_all_streams: bool,
    /// Raw messages to transmit, in order.
    pub transmissions: Vec<String>,
    /// Disconnect the session once the rest is applied.
    pub disconnect: bool,
}

/// Business-logic handler (for example an RPC client).
#[async_trait]
pub trait Controller: Send + Sync + fmt::Debug {
    /// Authenticates a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Unauthorized`] to reject the connection.
    async fn authenticate(&self, sid: &str, env: &SessionEnv)
    -> Result<ConnectResult, ControllerError>;

    /// Handles a channel subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if the subscription is rejected.
    async fn subscribe(
        &self,
        sid: &str,
        identifiers: &str,
        channel: &str,
    ) -> Result<CommandResult, ControllerError>;

    /// Handles a channel unsubscription.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] on failure.
    async fn unsubscribe(
        &self,
        sid: &str,
        identifiers: &str,
        channel: &str,
    ) -> Result<CommandResult, ControllerError>;

    /// Runs a channel action.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] on failure.
    async fn perform(
        &self,
        sid: &str,
        identifiers: &str,
        channel: &str,
        data: &str,
    ) -> Result<CommandResult, ControllerError>;

    /// Notifies the controller that a session ended.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] on failure; the caller only logs it.
    async fn disconnect(
        &self,
        sid: &str,
        identifiers: &str,
        subscriptions: &[String],
        env: &SessionEnv,
    ) -> Result<(), ControllerError>;

    /// Releases controller resources.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if cleanup fails.
    async fn shutdown(&self) -> Result<(), ControllerError>;
}
