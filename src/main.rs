//! fanout-gateway server entry point.
//!
//! Starts the Axum HTTP server with the WebSocket, SSE and backplane
//! endpoints, and shuts the node down gracefully on Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use fanout_gateway::api;
use fanout_gateway::app_state::AppState;
use fanout_gateway::broker::{Broker, MemoryBroker, NoopBroker, PostgresBroker};
use fanout_gateway::config::{BrokerConfig, BrokerKind, GatewayConfig};
use fanout_gateway::controller::PublicStreamsController;
use fanout_gateway::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = GatewayConfig::from_env().map_err(|err| anyhow::anyhow!("{err}"))?;
    tracing::info!(addr = %config.listen_addr, "starting fanout-gateway");

    // Build node core
    let broker = build_broker(&config.broker).await?;
    let node = Node::new(
        config.node.clone(),
        Arc::new(PublicStreamsController),
        broker,
    );
    node.start().await.context("failed to start broker")?;

    // Build router
    let app = api::build_app(AppState::new(Arc::clone(&node)));

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("http server stopped; shutting down node");
    node.shutdown().await?;

    Ok(())
}

async fn build_broker(config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = match config.kind {
        BrokerKind::None => Arc::new(NoopBroker::new()),
        BrokerKind::Memory => Arc::new(MemoryBroker::new(config)),
        BrokerKind::Postgres => Arc::new(
            PostgresBroker::connect(config)
                .await
                .context("failed to connect postgres broker")?,
        ),
    };
    Ok(broker)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
