//! Wire protocol
//!
//! Frame types and builders for the Pusher-compatible protocol. Protocol
//! event names are accepted with either the `pusher:` or `pusher.` prefix;
//! outbound spelling follows the contract established clients rely on:
//! `pusher.connection_established`, `pusher.pong` and connection-fatal
//! `pusher.error`, but `pusher:error` for non-fatal channel errors and
//! `pusher_internal:` for subscription lifecycle events.

use serde::Deserialize;
use serde_json::Value;

use crate::channel::PresenceMember;
use crate::connection::SocketId;
use crate::error::{BrokerError, Result};

/// Seconds of inactivity after which clients should send `pusher:ping`.
pub const ACTIVITY_TIMEOUT: u64 = 30;

/// Pre-serialized reply to `pusher:ping`; the ping fast path writes this
/// without building any JSON.
pub const PONG_FRAME: &str = r#"{"event":"pusher.pong"}"#;

/// Prefix of client-originated channel events.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

/// An incoming client frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub channel: Option<String>,
}

/// Returns the protocol event name (`subscribe`, `ping`, ...) when `event`
/// uses the reserved `pusher:` / `pusher.` prefix.
pub fn protocol_event(event: &str) -> Option<&str> {
    event
        .strip_prefix("pusher:")
        .or_else(|| event.strip_prefix("pusher."))
}

/// True for every reserved namespace an application handler may not claim.
pub fn is_reserved_event(event: &str) -> bool {
    protocol_event(event).is_some() || event.starts_with("pusher_internal:")
}

pub fn is_client_event(event: &str) -> bool {
    event.starts_with(CLIENT_EVENT_PREFIX)
}

/// Cheap pre-parse check for the two literal ping spellings. Anything that
/// carries extra fields or whitespace falls through to the full decoder,
/// which answers ping as well.
pub fn is_ping_frame(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed == r#"{"event":"pusher:ping"}"# || trimmed == r#"{"event":"pusher.ping"}"#
}

/// The `pusher:subscribe` payload.
#[derive(Debug, Clone)]
pub struct SubscribePayload {
    pub channel: String,
    pub auth: Option<String>,
    /// Kept in its raw string form: the auth signature covers these exact
    /// bytes for presence channels.
    pub channel_data: Option<String>,
}

impl SubscribePayload {
    pub fn from_data(data: Option<&Value>) -> Result<Self> {
        let data = data
            .ok_or_else(|| BrokerError::MalformedFrame("subscribe requires data".to_string()))?;
        let channel = data
            .get("channel")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::MalformedFrame("subscribe requires a channel".to_string()))?
            .to_string();
        let auth = data
            .get("auth")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);
        let channel_data = match data.get("channel_data") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(raw.clone()),
            Some(other) => Some(other.to_string()),
        };
        Ok(SubscribePayload {
            channel,
            auth,
            channel_data,
        })
    }
}

/// The `pusher:unsubscribe` payload.
pub fn unsubscribe_channel(data: Option<&Value>) -> Result<String> {
    data.and_then(|d| d.get("channel"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| BrokerError::MalformedFrame("unsubscribe requires a channel".to_string()))
}

// ---------------------------------------------------------------------------
// Outbound frame builders
// ---------------------------------------------------------------------------

/// `pusher.connection_established` with the nested JSON-string `data` the
/// protocol mandates.
pub fn connection_established(socket_id: &SocketId) -> String {
    let data = serde_json::json!({
        "socket_id": socket_id.as_str(),
        "activity_timeout": ACTIVITY_TIMEOUT,
    })
    .to_string();
    serde_json::json!({
        "event": "pusher.connection_established",
        "data": data,
    })
    .to_string()
}

/// Connection-fatal error announced right before the close frame.
pub fn connection_error(message: &str, code: u16) -> String {
    serde_json::json!({
        "event": "pusher.error",
        "data": { "message": message, "code": code },
    })
    .to_string()
}

/// Non-fatal error scoped to a channel or to the protocol conversation.
pub fn channel_error(channel: Option<&str>, message: &str, code: Option<u16>) -> String {
    let mut data = serde_json::Map::new();
    data.insert("message".to_string(), Value::String(message.to_string()));
    if let Some(code) = code {
        data.insert("code".to_string(), Value::from(code));
    }
    let mut frame = serde_json::Map::new();
    frame.insert(
        "event".to_string(),
        Value::String("pusher:error".to_string()),
    );
    if let Some(channel) = channel {
        frame.insert("channel".to_string(), Value::String(channel.to_string()));
    }
    frame.insert("data".to_string(), Value::Object(data));
    Value::Object(frame).to_string()
}

pub fn subscription_succeeded(channel: &str, presence: Option<Value>) -> String {
    let data = match presence {
        Some(payload) => payload.to_string(),
        None => "{}".to_string(),
    };
    serde_json::json!({
        "event": "pusher_internal:subscription_succeeded",
        "channel": channel,
        "data": data,
    })
    .to_string()
}

pub fn member_added(channel: &str, member: &PresenceMember) -> String {
    serde_json::json!({
        "event": "pusher_internal:member_added",
        "channel": channel,
        "data": serde_json::to_string(member).unwrap_or_else(|_| "{}".to_string()),
    })
    .to_string()
}

pub fn member_removed(channel: &str, user_id: &str) -> String {
    serde_json::json!({
        "event": "pusher_internal:member_removed",
        "channel": channel,
        "data": serde_json::json!({ "user_id": user_id }).to_string(),
    })
    .to_string()
}

/// A channel event as delivered to subscribers.
pub fn channel_event(event: &str, channel: &str, data: &Value) -> String {
    serde_json::json!({
        "event": event,
        "channel": channel,
        "data": data,
    })
    .to_string()
}

/// Terminal success reply for a dispatched event.
pub fn event_response(event: &str, payload: &Value) -> String {
    serde_json::json!({
        "event": format!("{}:response", event),
        "data": payload,
    })
    .to_string()
}

/// Intermediate progress reply for a dispatched event.
pub fn event_progress(event: &str, payload: &Value) -> String {
    serde_json::json!({
        "event": format!("{}:progress", event),
        "data": payload,
    })
    .to_string()
}

/// Error reply for a dispatched event. `reported` marks errors that were
/// also forwarded to telemetry.
pub fn event_error(event: &str, message: &str, reported: bool) -> String {
    let mut data = serde_json::Map::new();
    data.insert("message".to_string(), Value::String(message.to_string()));
    if reported {
        data.insert(
            "meta".to_string(),
            serde_json::json!({ "reported": true }),
        );
    }
    serde_json::json!({
        "event": format!("{}:error", event),
        "data": data,
    })
    .to_string()
}

/// Error reply carrying an arbitrary payload produced by a handler.
pub fn event_error_payload(event: &str, payload: &Value) -> String {
    serde_json::json!({
        "event": format!("{}:error", event),
        "data": payload,
    })
    .to_string()
}
