//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::node::Node;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Node core owning sessions, Hub and broker.
    pub node: Arc<Node>,
}

impl AppState {
    /// Wraps a started node.
    #[must_use]
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}
