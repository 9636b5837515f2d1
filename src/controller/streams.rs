//! Controller for public streams: every connection is accepted and a
//! channel identifier names the stream it follows.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{CommandResult, ConnectResult, Controller};
use crate::domain::SessionEnv;
use crate::error::ControllerError;

#[derive(Debug, Deserialize)]
struct ChannelParams {
    stream_name: String,
}

/// Accept-all controller mapping identifiers straight onto streams.
///
/// An identifier is either a JSON document with a `stream_name` field
/// (`{"channel":"$pubsub","stream_name":"room:1"}`) or a plain stream name.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicStreamsController;

impl PublicStreamsController {
    fn stream_for(channel: &str) -> Result<String, &'static str> {
        if channel.is_empty() {
            return Err("empty identifier");
        }
        match serde_json::from_str::<ChannelParams>(channel) {
            Ok(params) if !params.stream_name.is_empty() => Ok(params.stream_name),
            Ok(_) => Err("empty stream name"),
            Err(_) if channel.trim_start().starts_with('{') => Err("missing stream_name"),
            Err(_) => Ok(channel.to_string()),
        }
    }

    fn reply(reply_type: &str, channel: &str) -> String {
        json!({ "type": reply_type, "identifier": channel }).to_string()
    }
}

#[async_trait]
impl Controller for PublicStreamsController {
    async fn authenticate(
        &self,
        sid: &str,
        env: &SessionEnv,
    ) -> Result<ConnectResult, ControllerError> {
        Ok(ConnectResult {
            identifiers: json!({ "path": env.path }).to_string(),
            transmissions: vec![json!({ "type": "welcome", "sid": sid }).to_string()],
        })
    }

    async fn subscribe(
        &self,
        _sid: &str,
        _identifiers: &str,
        channel: &str,
    ) -> Result<CommandResult, ControllerError> {
        let stream = Self::stream_for(channel).map_err(|reason| {
            ControllerError::rejected_with(
                reason,
                CommandResult {
                    transmissions: vec![Self::reply("reject_subscription", channel)],
                    ..CommandResult::default()
                },
            )
        })?;
        Ok(CommandResult {
            streams: vec![stream],
            transmissions: vec![Self::reply("confirm_subscription", channel)],
            ..CommandResult::default()
        })
    }

    async fn unsubscribe(
        &self,
        _sid: &str,
        _identifiers: &str,
        channel: &str,
    ) -> Result<CommandResult, ControllerError> {
        Ok(CommandResult {
            stop_all_streams: true,
            transmissions: vec![Self::reply("confirm_unsubscription", channel)],
            ..CommandResult::default()
        })
    }

    async fn perform(
        &self,
        _sid: &str,
        _identifiers: &str,
        _channel: &str,
        _data: &str,
    ) -> Result<CommandResult, ControllerError> {
        Err(ControllerError::Rejected(
            "public streams are read-only".to_string(),
        ))
    }

    async fn disconnect(
        &self,
        _sid: &str,
        _identifiers: &str,
        _subscriptions: &[String],
        _env: &SessionEnv,
    ) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ControllerError> {
        Ok(())
    }
}
