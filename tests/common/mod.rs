//! Common test utilities for broker integration tests.

use std::time::Duration;

use crest::app::App;
use crest::config::BrokerConfig;
use crest::resolver::ControllerRegistry;
use crest::server::{start, BrokerHandle};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A broker bound to ephemeral ports with its scratch directory.
pub struct TestBroker {
    pub handle: BrokerHandle,
    pub dir: tempfile::TempDir,
}

#[allow(dead_code)]
pub fn test_app() -> App {
    App {
        id: "1".to_string(),
        key: "test-key".to_string(),
        secret: "test-secret".to_string(),
        name: "test".to_string(),
        capacity: None,
        client_messages_enabled: true,
        statistics_enabled: true,
        allowed_origins: Vec::new(),
    }
}

/// Starts a broker with the given apps and controllers; `configure` can
/// adjust the config before startup (ports are always ephemeral and data
/// lands in a per-test temp directory).
#[allow(dead_code)]
pub async fn start_broker_with<F>(
    apps: Vec<App>,
    controllers: ControllerRegistry,
    configure: F,
) -> TestBroker
where
    F: FnOnce(&mut BrokerConfig),
{
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        http_addr: "127.0.0.1:0".to_string(),
        apps,
        broadcast_socket_enabled: false,
        broadcast_socket_path: dir.path().join("broadcast.sock"),
        restart_marker_path: dir.path().join("restart.db"),
        ..BrokerConfig::default()
    };
    config.statistics.database_path = dir.path().join("statistics.db");
    configure(&mut config);

    let handle = start(config, controllers).await.expect("broker start");
    TestBroker { handle, dir }
}

#[allow(dead_code)]
pub async fn start_broker(apps: Vec<App>) -> TestBroker {
    start_broker_with(apps, ControllerRegistry::new(), |_| {}).await
}

/// Opens a WebSocket connection with the given app key.
#[allow(dead_code)]
pub async fn connect(broker: &TestBroker, app_key: &str) -> WsClient {
    connect_with_origin(broker, app_key, None).await
}

/// Opens a WebSocket connection, optionally with an Origin header.
#[allow(dead_code)]
pub async fn connect_with_origin(
    broker: &TestBroker,
    app_key: &str,
    origin: Option<&str>,
) -> WsClient {
    let url = format!("ws://{}/?appKey={}", broker.handle.ws_addr, app_key);
    let mut request = url.into_client_request().expect("client request");
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("origin", origin.parse().unwrap());
    }
    let (ws, _) = connect_async(request).await.expect("websocket connect");
    ws
}

/// Receives the next text frame as JSON, or `None` when the connection
/// closes first.
#[allow(dead_code)]
pub async fn try_next_json(ws: &mut WsClient) -> Option<Value> {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("frame within deadline")?;
        match frame {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(&text).expect("valid frame json"))
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Receives the next text frame as JSON, failing the test on close.
#[allow(dead_code)]
pub async fn next_json(ws: &mut WsClient) -> Value {
    try_next_json(ws).await.expect("expected a text frame")
}

/// Asserts that no text frame arrives within the grace window.
#[allow(dead_code)]
pub async fn assert_silent(ws: &mut WsClient, grace: Duration) {
    match timeout(grace, ws.next()).await {
        Err(_) => {}
        Ok(None) => {}
        Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {}", text),
        Ok(Some(_)) => {}
    }
}

/// Reads the `connection_established` frame and returns the socket id.
#[allow(dead_code)]
pub async fn established(ws: &mut WsClient) -> String {
    let frame = next_json(ws).await;
    assert_eq!(
        frame["event"], "pusher.connection_established",
        "expected connection_established, got {}",
        frame
    );
    let inner: Value =
        serde_json::from_str(frame["data"].as_str().expect("nested data string")).unwrap();
    assert_eq!(inner["activity_timeout"], 30);
    inner["socket_id"].as_str().expect("socket id").to_string()
}

/// Sends a JSON value as a text frame.
#[allow(dead_code)]
pub async fn send_json(ws: &mut WsClient, value: &Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

/// Subscribes to a public channel and waits for the confirmation.
#[allow(dead_code)]
pub async fn subscribe(ws: &mut WsClient, channel: &str) {
    send_json(
        ws,
        &serde_json::json!({
            "event": "pusher:subscribe",
            "data": { "channel": channel },
        }),
    )
    .await;
    let frame = next_json(ws).await;
    assert_eq!(frame["event"], "pusher_internal:subscription_succeeded");
    assert_eq!(frame["channel"], channel);
}
