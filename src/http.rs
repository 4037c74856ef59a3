//! HTTP Surface
//!
//! The signed admin API (trigger-event, fetch-channels, fetch-channel,
//! fetch-users) plus the Prometheus metrics endpoint. API requests carry
//! an `auth_signature` query parameter computed over the canonical
//! request string under the app secret; a missing app or a bad signature
//! both answer 401.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::app::{App, AppRegistry};
use crate::auth;
use crate::channel::ChannelType;
use crate::connection::SocketId;
use crate::metrics::BrokerMetrics;
use crate::protocol;
use crate::registry::ChannelRegistry;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub apps: Arc<dyn AppRegistry>,
    pub registry: Arc<ChannelRegistry>,
    pub metrics: BrokerMetrics,
}

/// Creates the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/apps/:app_id/events", post(trigger_event))
        .route("/apps/:app_id/channels", get(fetch_channels))
        .route("/apps/:app_id/channels/:channel_name", get(fetch_channel))
        .route(
            "/apps/:app_id/channels/:channel_name/users",
            get(fetch_users),
        )
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "crest",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/metrics", "/apps/{app_id}/events", "/apps/{app_id}/channels"],
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

fn unauthorized(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": message })),
    )
}

/// Resolves the app and verifies the request signature.
async fn authenticate(
    state: &HttpState,
    app_id: &str,
    method: &str,
    uri: &Uri,
    params: &HashMap<String, String>,
    body: &[u8],
) -> Result<App, (StatusCode, Json<Value>)> {
    let app = state
        .apps
        .find_by_id(app_id)
        .await
        .ok_or_else(|| unauthorized("unknown app"))?;

    let pairs = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()));
    auth::verify_api_signature(
        &app,
        method,
        uri.path(),
        pairs,
        params.get("auth_signature").map(String::as_str),
        body,
    )
    .map_err(|e| {
        debug!(app_id = %app_id, error = %e, "api signature rejected");
        unauthorized("invalid signature")
    })?;
    Ok(app)
}

/// Body of a trigger-event request. `data` passes through to subscribers
/// verbatim, string or structured.
#[derive(Debug, Deserialize)]
struct TriggerEventBody {
    name: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channels: Option<Vec<String>>,
    #[serde(default)]
    data: Value,
    /// Excluded from the broadcast, mirroring client-event semantics.
    #[serde(default)]
    socket_id: Option<String>,
}

async fn trigger_event(
    State(state): State<HttpState>,
    Path(app_id): Path<String>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let app = match authenticate(&state, &app_id, "POST", &uri, &params, &body).await {
        Ok(app) => app,
        Err(rejection) => return rejection,
    };

    let event: TriggerEventBody = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid body: {}", e) })),
            )
        }
    };

    let mut channels = event.channels.unwrap_or_default();
    if let Some(channel) = event.channel {
        channels.push(channel);
    }
    if channels.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "channel or channels required" })),
        );
    }

    let mut except = HashSet::new();
    if let Some(socket_id) = event.socket_id {
        except.insert(SocketId::from_string(socket_id));
    }

    for channel in &channels {
        let frame = protocol::channel_event(&event.name, channel, &event.data);
        state.registry.broadcast(&app.id, channel, &frame, &except);
        state.metrics.broadcasts_total.inc();
    }

    (StatusCode::OK, Json(json!({})))
}

async fn fetch_channels(
    State(state): State<HttpState>,
    Path(app_id): Path<String>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let app = match authenticate(&state, &app_id, "GET", &uri, &params, b"").await {
        Ok(app) => app,
        Err(rejection) => return rejection,
    };

    let mut channels = serde_json::Map::new();
    for (name, count) in state.registry.channels_overview(&app.id) {
        channels.insert(
            name,
            json!({ "occupied": count > 0, "subscription_count": count }),
        );
    }
    (StatusCode::OK, Json(json!({ "channels": channels })))
}

async fn fetch_channel(
    State(state): State<HttpState>,
    Path((app_id, channel_name)): Path<(String, String)>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let app = match authenticate(&state, &app_id, "GET", &uri, &params, b"").await {
        Ok(app) => app,
        Err(rejection) => return rejection,
    };

    let count = state
        .registry
        .find_channel_connection_count(&app.id, &channel_name)
        .unwrap_or(0);
    (
        StatusCode::OK,
        Json(json!({ "occupied": count > 0, "subscription_count": count })),
    )
}

async fn fetch_users(
    State(state): State<HttpState>,
    Path((app_id, channel_name)): Path<(String, String)>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let app = match authenticate(&state, &app_id, "GET", &uri, &params, b"").await {
        Ok(app) => app,
        Err(rejection) => return rejection,
    };

    if ChannelType::from_name(&channel_name) != ChannelType::Presence {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "users are only available for presence channels" })),
        );
    }

    let users: Vec<Value> = state
        .registry
        .presence_users(&app.id, &channel_name)
        .unwrap_or_default()
        .into_iter()
        .map(|m| json!({ "id": m.user_id }))
        .collect();
    (StatusCode::OK, Json(json!({ "users": users })))
}
