//! WebSocket Session
//!
//! Admission and the per-connection protocol loop. A session is admitted
//! in a fixed order (gate, remote address, app key, origin, capacity),
//! then handed a socket id and its `connection_established` frame. The
//! read loop answers pings on a fast path, routes subscribe/unsubscribe
//! into the channel registry, applies the client-event policy, and hands
//! everything else to the dispatch engine without waiting on it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::app::AppRegistry;
use crate::connection::{Connection, SocketId};
use crate::dispatch::Dispatcher;
use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;
use crate::protocol::{self, ClientFrame, SubscribePayload};
use crate::registry::ChannelRegistry;
use crate::stats::StatisticsCollector;

/// Upper bound on admission checks that consult async backends.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a session needs, shared across all sessions.
#[derive(Clone)]
pub struct SessionDeps {
    pub apps: Arc<dyn AppRegistry>,
    pub registry: Arc<ChannelRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: Arc<StatisticsCollector>,
    pub metrics: BrokerMetrics,
    pub max_request_size: usize,
}

#[derive(Default)]
struct HandshakeInfo {
    path: String,
    query: HashMap<String, String>,
    origin: Option<String>,
    forwarded_for: Option<String>,
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = query {
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            if let Some(key) = parts.next() {
                if !key.is_empty() {
                    params.insert(key.to_string(), parts.next().unwrap_or("").to_string());
                }
            }
        }
    }
    params
}

/// Serves one client socket from handshake to teardown.
pub async fn handle_socket<S>(stream: S, peer_addr: SocketAddr, deps: SessionDeps)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut info = HandshakeInfo::default();
    let ws = match accept_hdr_async(stream, |req: &Request, response: Response| {
        info.path = req.uri().path().to_string();
        info.query = parse_query(req.uri().query());
        info.origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        info.forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Ok(response)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer_addr, error = %e, "websocket handshake failed");
            deps.metrics.connection_errors.inc();
            return;
        }
    };

    if !deps.registry.accepts_new_connections() {
        debug!(peer = %peer_addr, "declining new connection");
        return;
    }

    let remote_address = info
        .forwarded_for
        .as_deref()
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| peer_addr.ip().to_string());

    let app_key = info
        .query
        .get("appKey")
        .cloned()
        .or_else(|| info.path.strip_prefix("/app/").map(String::from))
        .unwrap_or_default();

    let app = match timeout(ADMISSION_TIMEOUT, deps.apps.find_by_key(&app_key)).await {
        Ok(Some(app)) => app,
        _ => {
            let err = BrokerError::UnknownAppKey(app_key);
            reject(ws, &deps, &err).await;
            return;
        }
    };

    if !app.origin_allowed(info.origin.as_deref()) {
        reject(ws, &deps, &BrokerError::OriginNotAllowed).await;
        return;
    }

    if let Some(capacity) = app.capacity {
        let current = deps.registry.global_connections_count(&app.id);
        if current >= capacity {
            reject(ws, &deps, &BrokerError::OverCapacity).await;
            return;
        }
    }

    let (mut ws_sink, mut ws_stream) = ws.split();

    // Socket ids are random; regenerate on the rare registration collision.
    let (connection, mut outbound_rx) = loop {
        let (connection, outbound_rx) =
            Connection::new(SocketId::generate(), app.clone(), remote_address.clone());
        let connection = Arc::new(connection);
        if deps.registry.register_connection(connection.clone()).is_ok() {
            break (connection, outbound_rx);
        }
    };

    let writer_metrics = deps.metrics.clone();
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sink.send(message).await.is_err() {
                break;
            }
            writer_metrics.messages_sent.inc();
            if closing {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    connection.send_text(protocol::connection_established(connection.socket_id()));
    connection.touch_pong();

    deps.metrics.connections_total.inc();
    deps.metrics.connections_active.inc();
    deps.stats.mark_new_connection(&app);
    info!(socket_id = %connection.socket_id(), app = %app.id, remote = %remote_address, "connection established");

    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handle_text(&deps, &connection, &text);
            }
            Ok(Message::Ping(payload)) => {
                connection.touch_pong();
                connection.send_pong(payload);
            }
            Ok(Message::Pong(_)) => {
                connection.touch_pong();
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(socket_id = %connection.socket_id(), error = %e, "read error");
                break;
            }
        }
    }

    teardown(&deps, &connection);
}

/// Reports a fatal admission error and closes the socket.
async fn reject<S>(
    mut ws: tokio_tungstenite::WebSocketStream<S>,
    deps: &SessionDeps,
    err: &BrokerError,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(error = %err, "connection rejected");
    deps.metrics.connection_errors.inc();
    let code = err.close_code();
    let _ = ws
        .send(Message::Text(protocol::connection_error(
            &err.to_string(),
            code,
        )))
        .await;
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: err.to_string().into(),
        })))
        .await;
    let _ = ws.close(None).await;
}

/// Runs the onClose sequence exactly once per connection.
fn teardown(deps: &SessionDeps, connection: &Arc<Connection>) {
    connection.clear_principal();
    deps.registry.unsubscribe_from_all(connection);
    deps.registry
        .remove_connection(&connection.app().id, connection.socket_id());
    connection.close(1000, "");
    deps.metrics.connections_active.dec();
    deps.stats.mark_disconnection(connection.app());
    info!(socket_id = %connection.socket_id(), "connection closed");
}

/// Routes one inbound text frame.
fn handle_text(deps: &SessionDeps, connection: &Arc<Connection>, text: &str) {
    deps.metrics.messages_received.inc();
    deps.stats.mark_message_received(connection.app());

    // Ping fast path: answer the literal spellings with a canned frame
    // before any JSON work.
    if protocol::is_ping_frame(text) {
        connection.touch_pong();
        connection.send_text(protocol::PONG_FRAME.to_string());
        return;
    }

    if text.len() > deps.max_request_size {
        deps.metrics.messages_rejected.inc();
        connection.send_text(protocol::channel_error(
            None,
            &BrokerError::PayloadTooLarge.to_string(),
            None,
        ));
        return;
    }

    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            deps.metrics.messages_rejected.inc();
            debug!(socket_id = %connection.socket_id(), error = %e, "malformed frame");
            connection.send_text(protocol::channel_error(None, "Malformed message", None));
            return;
        }
    };

    if let Some(event) = protocol::protocol_event(&frame.event) {
        handle_protocol_event(deps, connection, event, &frame);
        return;
    }

    if frame.event.starts_with("pusher_internal:") {
        debug!(event = %frame.event, "ignoring reserved event from client");
        return;
    }

    if protocol::is_client_event(&frame.event) {
        handle_client_event(deps, connection, &frame);
        return;
    }

    // Application event: requires an established subscription when a
    // channel is named.
    if let Some(channel) = frame.channel.as_deref() {
        if !connection.is_subscribed(channel) {
            connection.send_text(protocol::event_error(
                &frame.event,
                &BrokerError::NotSubscribed.to_string(),
                false,
            ));
            return;
        }
    }
    deps.dispatcher.dispatch(
        connection,
        frame.event,
        frame.data.unwrap_or(Value::Null),
        frame.channel,
    );
}

fn handle_protocol_event(
    deps: &SessionDeps,
    connection: &Arc<Connection>,
    event: &str,
    frame: &ClientFrame,
) {
    match event {
        "ping" => {
            connection.touch_pong();
            connection.send_text(protocol::PONG_FRAME.to_string());
        }
        "pong" => {
            connection.touch_pong();
        }
        "subscribe" => {
            let payload = match SubscribePayload::from_data(frame.data.as_ref()) {
                Ok(payload) => payload,
                Err(e) => {
                    connection.send_text(protocol::channel_error(None, &e.to_string(), None));
                    return;
                }
            };
            let channel = payload.channel.clone();
            if let Err(e) = deps.registry.subscribe(connection, &payload) {
                debug!(socket_id = %connection.socket_id(), channel = %channel, error = %e, "subscribe failed");
                connection.send_text(protocol::channel_error(
                    Some(&channel),
                    &e.to_string(),
                    Some(e.close_code()),
                ));
            }
        }
        "unsubscribe" => match protocol::unsubscribe_channel(frame.data.as_ref()) {
            Ok(channel) => deps.registry.unsubscribe(connection, &channel),
            Err(e) => {
                connection.send_text(protocol::channel_error(None, &e.to_string(), None));
            }
        },
        other => {
            debug!(event = %other, "unhandled protocol event");
        }
    }
}

/// Client events relay between subscribers of a channel. The app policy
/// and the sender's own subscription gate them; failures are dropped
/// without a reply, so a disabled app produces no outbound frames at all.
fn handle_client_event(deps: &SessionDeps, connection: &Arc<Connection>, frame: &ClientFrame) {
    if !connection.app().client_messages_enabled {
        debug!(app = %connection.app().id, "client events disabled");
        return;
    }
    let channel = match frame.channel.as_deref() {
        Some(channel) => channel,
        None => {
            debug!(event = %frame.event, "client event without channel");
            return;
        }
    };
    if !connection.is_subscribed(channel) {
        debug!(socket_id = %connection.socket_id(), channel = %channel, "client event on unsubscribed channel");
        return;
    }

    let data = frame.data.clone().unwrap_or(Value::Null);
    let outbound = protocol::channel_event(&frame.event, channel, &data);
    let mut except = HashSet::new();
    except.insert(connection.socket_id().clone());

    let sent = deps
        .registry
        .broadcast(&connection.app().id, channel, &outbound, &except);
    deps.metrics.broadcasts_total.inc();
    deps.stats
        .mark_messages_sent(connection.app(), sent as u64);
}
