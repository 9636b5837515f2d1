//! # fanout-gateway
//!
//! Real-time publish/subscribe gateway. Clients connect over WebSocket or
//! Server-Sent Events, subscribe to channels, and receive every message a
//! backplane publishes on the streams those channels map to.
//!
//! Authentication and channel → stream mapping are delegated to a
//! [`controller::Controller`]; history and reconnect continuity to a
//! [`broker::Broker`]. This crate is the coordination layer in between.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket, SSE)          Publishers (POST /_broadcast)
//!     │                                  │
//!     ├── Transports (transport/)        ├── Broker (broker/)
//!     │                                  │      history, sessions
//!     ├── Session (node/session)         │
//!     │      send queue, keepalive       │
//!     │                                  │
//!     ├── Node (node/) ───────────────── Hub (node/hub)
//!     │      command dispatch               stream → sessions
//!     │
//!     ├── DisconnectQueue (node/disconnector)
//!     │
//!     └── Controller (controller/)
//! ```

pub mod api;
pub mod app_state;
pub mod broker;
pub mod config;
pub mod controller;
pub mod domain;
pub mod encoders;
pub mod error;
pub mod node;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
