//! Inbound message types: client command envelopes and backplane messages.
//!
//! Client envelopes are parsed once into a [`Command`] so that dispatch in
//! the node is a match over variants rather than string comparisons.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Raw client command envelope as it arrives on the wire.
///
/// ```json
/// {"command": "subscribe", "identifier": "chat", "data": "..."}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Command name (`subscribe`, `unsubscribe`, `message`, `history`).
    pub command: String,
    /// Channel identifier the command targets.
    #[serde(default)]
    pub identifier: String,
    /// Command payload (only meaningful for `message`).
    #[serde(default, deserialize_with = "string_or_json")]
    pub data: String,
    /// History request (only meaningful for `history`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryRequest>,
}

/// Client command resolved from an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Attach a channel identifier.
    Subscribe {
        /// Channel identifier.
        identifier: String,
    },
    /// Detach a channel identifier and all its streams.
    Unsubscribe {
        /// Channel identifier.
        identifier: String,
    },
    /// Run an action on an attached channel.
    Perform {
        /// Channel identifier.
        identifier: String,
        /// Action payload, passed verbatim to the controller.
        data: String,
    },
    /// Replay missed stream messages for an attached channel.
    History {
        /// Channel identifier.
        identifier: String,
        /// Resume positions.
        request: HistoryRequest,
    },
    /// Unrecognised command name; logged and dropped.
    Unknown(String),
}

impl From<Envelope> for Command {
    fn from(env: Envelope) -> Self {
        match env.command.as_str() {
            "subscribe" => Self::Subscribe {
                identifier: env.identifier,
            },
            "unsubscribe" => Self::Unsubscribe {
                identifier: env.identifier,
            },
            "message" => Self::Perform {
                identifier: env.identifier,
                data: env.data,
            },
            "history" => Self::History {
                identifier: env.identifier,
                request: env.history.unwrap_or_default(),
            },
            _ => Self::Unknown(env.command),
        }
    }
}

impl Command {
    /// Parses a raw JSON envelope into a command.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when `raw` is not a valid envelope.
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice::<Envelope>(raw).map(Self::from)
    }
}

/// Resume position inside one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    /// Broker generation the offset belongs to.
    pub epoch: String,
    /// Last offset the client has seen.
    pub offset: u64,
}

/// History request attached to a `history` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Unix timestamp (seconds) to fall back to when no position is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    /// Known positions keyed by stream name.
    #[serde(default)]
    pub streams: HashMap<String, StreamPosition>,
}

/// Message published on a stream, as delivered by the backplane.
///
/// `offset` and `epoch` are assigned by the broker when it records history;
/// they stay empty for brokers without history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Target stream.
    pub stream: String,
    /// Payload, usually a JSON document encoded as a string.
    #[serde(deserialize_with = "string_or_json")]
    pub data: String,
    /// Position within the stream.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    /// Broker generation of `offset`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
}

impl StreamMessage {
    /// Creates an unpositioned message.
    #[must_use]
    pub fn new(stream: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            data: data.into(),
            offset: 0,
            epoch: String::new(),
        }
    }
}

/// Payload of a remote disconnect instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDisconnect {
    /// Connection identifiers of the sessions to drop.
    pub identifier: String,
    /// Whether clients may reconnect.
    #[serde(default)]
    pub reconnect: bool,
}

/// Out-of-band control message delivered by the backplane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Disconnect every session with matching identifiers.
    Disconnect(RemoteDisconnect),
}

/// Anything the backplane can deliver to a node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PubSubMessage {
    /// Control instruction.
    Command(RemoteCommand),
    /// Stream broadcast.
    Broadcast(StreamMessage),
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Accepts either a JSON string or any other JSON value, which is kept in
/// its serialized form.
fn string_or_json<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        let Ok(cmd) = Command::parse(br#"{"command":"subscribe","identifier":"chat"}"#) else {
            panic!("valid subscribe");
        };
        assert_eq!(
            cmd,
            Command::Subscribe {
                identifier: "chat".to_string()
            }
        );

        let Ok(cmd) =
            Command::parse(br#"{"command":"message","identifier":"chat","data":"{\"a\":1}"}"#)
        else {
            panic!("valid message");
        };
        assert_eq!(
            cmd,
            Command::Perform {
                identifier: "chat".to_string(),
                data: r#"{"a":1}"#.to_string()
            }
        );
    }

    #[test]
    fn object_data_is_kept_as_json_text() {
        let Ok(cmd) = Command::parse(br#"{"command":"message","identifier":"c","data":{"a":1}}"#)
        else {
            panic!("valid message");
        };
        let Command::Perform { data, .. } = cmd else {
            panic!("expected perform");
        };
        assert_eq!(data, r#"{"a":1}"#);
    }

    #[test]
    fn unknown_command_is_preserved() {
        let Ok(cmd) = Command::parse(br#"{"command":"dance","identifier":"x"}"#) else {
            panic!("valid envelope");
        };
        assert_eq!(cmd, Command::Unknown("dance".to_string()));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Command::parse(b"{not json").is_err());
    }

    #[test]
    fn history_command_carries_positions() {
        let raw = br#"{"command":"history","identifier":"chat",
            "history":{"since":1700000000,"streams":{"room:1":{"epoch":"ab","offset":7}}}}"#;
        let Ok(Command::History { identifier, request }) = Command::parse(raw) else {
            panic!("expected history");
        };
        assert_eq!(identifier, "chat");
        assert_eq!(request.since, Some(1_700_000_000));
        assert_eq!(
            request.streams.get("room:1"),
            Some(&StreamPosition {
                epoch: "ab".to_string(),
                offset: 7
            })
        );
    }

    #[test]
    fn pubsub_distinguishes_commands_from_broadcasts() {
        let Ok(msg) = serde_json::from_str::<PubSubMessage>(r#"{"stream":"room:1","data":"hello"}"#)
        else {
            panic!("valid broadcast");
        };
        assert_eq!(
            msg,
            PubSubMessage::Broadcast(StreamMessage::new("room:1", "hello"))
        );

        let Ok(msg) = serde_json::from_str::<PubSubMessage>(
            r#"{"command":"disconnect","payload":{"identifier":"user:1","reconnect":true}}"#,
        ) else {
            panic!("valid command");
        };
        assert_eq!(
            msg,
            PubSubMessage::Command(RemoteCommand::Disconnect(RemoteDisconnect {
                identifier: "user:1".to_string(),
                reconnect: true
            }))
        );
    }
}
