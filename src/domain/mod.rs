//! Domain layer: wire-independent message and session types.
//!
//! Inbound client envelopes and backplane messages, the typed outbound
//! replies sessions send, and the request environment / snapshot pair used
//! for session continuity.

pub mod messages;
pub mod replies;
pub mod session_env;

pub use messages::{
    Command, Envelope, HistoryRequest, PubSubMessage, RemoteCommand, RemoteDisconnect,
    StreamMessage, StreamPosition,
};
pub use replies::{DisconnectMessage, OutboundMessage, PingMessage, Reply};
pub use session_env::{RESTORE_SID_HEADER, SessionEnv, SessionSnapshot};
