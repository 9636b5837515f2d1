//! End-to-end tests: a real server on an ephemeral port, a WebSocket client
//! and an HTTP publisher.
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use fanout_gateway::api;
use fanout_gateway::app_state::AppState;
use fanout_gateway::broker::MemoryBroker;
use fanout_gateway::config::{BrokerConfig, NodeConfig};
use fanout_gateway::controller::PublicStreamsController;
use fanout_gateway::node::Node;

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn spawn_gateway() -> (String, Arc<Node>) {
    let broker = Arc::new(MemoryBroker::new(&BrokerConfig::default()));
    let node = Node::new(
        NodeConfig::default(),
        Arc::new(PublicStreamsController),
        broker,
    );
    let Ok(()) = node.start().await else {
        panic!("node failed to start");
    };

    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local addr");
    };
    let app = api::build_app(AppState::new(Arc::clone(&node)));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr.to_string(), node)
}

/// Next JSON text frame, skipping pings.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next()).await;
        let Ok(Some(Ok(msg))) = frame else {
            panic!("no frame received: {frame:?}");
        };
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
            panic!("not json: {text}");
        };
        if value.get("type") == Some(&json!("ping")) {
            continue;
        }
        return value;
    }
}

async fn connect(addr: &str) -> Client {
    connect_with(addr, None).await
}

async fn connect_with(addr: &str, restore_sid: Option<&str>) -> Client {
    let Ok(mut request) = format!("ws://{addr}/ws").into_client_request() else {
        panic!("invalid websocket url");
    };
    if let Some(sid) = restore_sid {
        let Ok(value) = HeaderValue::from_str(sid) else {
            panic!("invalid session id");
        };
        request.headers_mut().insert("x-restore-sid", value);
    }
    let Ok((client, _)) = tokio_tungstenite::connect_async(request).await else {
        panic!("websocket handshake failed");
    };
    client
}

/// Reads the welcome frame and returns the session id it announces.
async fn welcome(client: &mut Client) -> String {
    let msg = next_json(client).await;
    assert_eq!(msg.get("type"), Some(&json!("welcome")));
    let Some(sid) = msg.get("sid").and_then(Value::as_str) else {
        panic!("welcome without sid: {msg}");
    };
    sid.to_string()
}

async fn subscribe(client: &mut Client, identifier: &str) {
    let command = json!({"command": "subscribe", "identifier": identifier}).to_string();
    let Ok(()) = client.send(Message::text(command)).await else {
        panic!("send failed");
    };
    assert_eq!(
        next_json(client).await,
        json!({"type": "confirm_subscription", "identifier": identifier})
    );
}

async fn publish(addr: &str, stream: &str, data: &str) {
    let res = reqwest::Client::new()
        .post(format!("http://{addr}/_broadcast"))
        .body(json!({"stream": stream, "data": data}).to_string())
        .send()
        .await;
    let Ok(res) = res else {
        panic!("broadcast request failed");
    };
    assert_eq!(res.status(), reqwest::StatusCode::ACCEPTED);
}

async fn session_count(addr: &str) -> Option<Value> {
    let Ok(res) = reqwest::get(format!("http://{addr}/stats")).await else {
        panic!("stats request failed");
    };
    let Ok(stats) = res.json::<Value>().await else {
        panic!("stats body is not json");
    };
    stats.get("sessions").cloned()
}

/// Polls `/stats` until the session count settles on `expected`.
async fn wait_for_sessions(addr: &str, expected: u64) {
    for _ in 0..50 {
        if session_count(addr).await == Some(json!(expected)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {expected} sessions");
}

#[tokio::test]
async fn subscribed_client_receives_published_message() {
    let (addr, _node) = spawn_gateway().await;
    let mut client = connect(&addr).await;

    let sid = welcome(&mut client).await;
    assert!(!sid.is_empty());
    subscribe(&mut client, "room:1").await;

    publish(&addr, "room:1", "{\"text\":\"hi\"}").await;

    let msg = next_json(&mut client).await;
    assert_eq!(msg.get("identifier"), Some(&json!("room:1")));
    assert_eq!(msg.get("message"), Some(&json!({"text": "hi"})));
}

#[tokio::test]
async fn reconnecting_client_restores_its_subscriptions() {
    let (addr, _node) = spawn_gateway().await;
    let mut first = connect(&addr).await;
    let sid = welcome(&mut first).await;
    subscribe(&mut first, "room:1").await;
    let Ok(()) = first.close(None).await else {
        panic!("close failed");
    };
    wait_for_sessions(&addr, 0).await;

    let mut second = connect_with(&addr, Some(&sid)).await;
    let restored = next_json(&mut second).await;
    assert_eq!(restored.get("type"), Some(&json!("welcome")));
    assert_eq!(restored.get("restored"), Some(&json!(true)));
    assert_ne!(restored.get("sid"), Some(&json!(sid)));

    publish(&addr, "room:1", "again").await;

    let msg = next_json(&mut second).await;
    assert_eq!(msg.get("identifier"), Some(&json!("room:1")));
    assert_eq!(msg.get("message"), Some(&json!("again")));
}

#[tokio::test]
async fn malformed_broadcast_is_rejected() {
    let (addr, _node) = spawn_gateway().await;
    let res = reqwest::Client::new()
        .post(format!("http://{addr}/_broadcast"))
        .body("not json")
        .send()
        .await;
    let Ok(res) = res else {
        panic!("broadcast request failed");
    };
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_stats_report_live_sessions() {
    let (addr, _node) = spawn_gateway().await;
    let http = reqwest::Client::new();

    let Ok(res) = http.get(format!("http://{addr}/health")).send().await else {
        panic!("health request failed");
    };
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let Ok(body) = res.json::<Value>().await else {
        panic!("health body is not json");
    };
    assert_eq!(body.get("status"), Some(&json!("healthy")));

    let mut client = connect(&addr).await;
    welcome(&mut client).await;
    wait_for_sessions(&addr, 1).await;
}
