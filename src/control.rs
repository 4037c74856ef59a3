//! Local Broadcast Control Plane
//!
//! Unix-domain-socket listener that lets local peer processes inject
//! broadcasts into running channels. Frames are newline-delimited JSON,
//! one request per line, answered in arrival order per client. A failure
//! to bind disables only this feature; the broker keeps serving.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::SocketId;
use crate::metrics::BrokerMetrics;
use crate::protocol;
use crate::registry::ChannelRegistry;
use crate::restart::Shutdown;

/// One broadcast command from a local peer.
#[derive(Debug, Deserialize)]
struct ControlRequest {
    event: String,
    channel: String,
    #[serde(default)]
    data: Value,
    /// Whisper to these socket ids among the channel's members.
    #[serde(default)]
    sockets: Option<Vec<String>>,
    /// Broadcast to everyone except these socket ids.
    #[serde(default)]
    exclude_sockets: Option<Vec<String>>,
    /// Pin the command to one app; otherwise every app carrying the
    /// channel is targeted.
    #[serde(default)]
    app_id: Option<String>,
}

/// The reply frame for one command.
#[derive(Debug, Serialize)]
struct ControlResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ControlResponse {
    fn ok() -> Self {
        ControlResponse {
            success: true,
            warning: None,
            error: None,
        }
    }

    fn warning(message: &str) -> Self {
        ControlResponse {
            success: true,
            warning: Some(message.to_string()),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        ControlResponse {
            success: false,
            warning: None,
            error: Some(message),
        }
    }
}

/// Binds the control socket and spawns the accept loop. Returns `None`
/// (and logs) when the socket cannot be bound.
pub fn spawn_control_listener(
    path: PathBuf,
    registry: Arc<ChannelRegistry>,
    metrics: BrokerMetrics,
    shutdown: Shutdown,
) -> Option<JoinHandle<()>> {
    // A previous process may have left its socket file behind.
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "broadcast socket disabled: bind failed");
            return None;
        }
    };
    if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)) {
        warn!(path = %path.display(), error = %e, "could not set broadcast socket permissions");
    }
    info!(path = %path.display(), "broadcast socket listening");

    let handle = tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let registry = registry.clone();
                            let metrics = metrics.clone();
                            tokio::spawn(async move {
                                serve_client(stream, registry, metrics).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "broadcast socket accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&path);
    });
    Some(handle)
}

/// Serves one control client: requests are answered in arrival order.
async fn serve_client(stream: UnixStream, registry: Arc<ChannelRegistry>, metrics: BrokerMetrics) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        metrics.control_requests.inc();
        let response = process_request(&line, &registry);
        if !response.success {
            metrics.control_errors.inc();
        }
        let mut encoded = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"success":false,"error":"encoding failed"}"#.to_string());
        encoded.push('\n');
        if write_half.write_all(encoded.as_bytes()).await.is_err() {
            break;
        }
    }
    debug!("control client disconnected");
}

fn process_request(line: &str, registry: &ChannelRegistry) -> ControlResponse {
    let request: ControlRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return ControlResponse::error(format!("invalid request: {}", e)),
    };
    if request.event.is_empty() {
        return ControlResponse::error("event must not be empty".to_string());
    }

    let app_ids = match &request.app_id {
        Some(app_id) => {
            if registry
                .find_channel_connection_count(app_id, &request.channel)
                .is_none()
            {
                Vec::new()
            } else {
                vec![app_id.clone()]
            }
        }
        None => registry.apps_with_channel(&request.channel),
    };
    if app_ids.is_empty() {
        return ControlResponse::warning("No channel subscribers");
    }

    let frame = protocol::channel_event(&request.event, &request.channel, &request.data);

    match &request.sockets {
        Some(sockets) => {
            let socket_ids: Vec<SocketId> = sockets
                .iter()
                .map(|s| SocketId::from_string(s.clone()))
                .collect();
            for app_id in &app_ids {
                registry.whisper(app_id, Some(&request.channel), &socket_ids, &frame);
            }
        }
        None => {
            let except: HashSet<SocketId> = request
                .exclude_sockets
                .unwrap_or_default()
                .into_iter()
                .map(SocketId::from_string)
                .collect();
            for app_id in &app_ids {
                registry.broadcast(app_id, &request.channel, &frame, &except);
            }
        }
    }
    ControlResponse::ok()
}
