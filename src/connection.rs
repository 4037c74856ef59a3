//! Connection Object
//!
//! One live client connection: its socket id, resolved app, authenticated
//! principal, and the ordered outbound sink. Frames are queued on a bounded
//! channel drained by a single writer task, so per-connection output is
//! FIFO and a slow client never blocks dispatch for other connections.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use crate::app::App;

/// Outbound queue depth per connection. Back-pressure is per-connection:
/// when a client stops reading, its queue fills and further frames drop.
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Unique connection identifier in the `<int>.<int>` wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketId(String);

impl SocketId {
    /// Generates a fresh id; uniqueness among live connections is enforced
    /// by the channel registry at registration time.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        SocketId(format!(
            "{}.{}",
            rng.gen_range(1..=1_000_000_000u64),
            rng.gen_range(1..=1_000_000_000u64)
        ))
    }

    pub fn from_string(raw: String) -> Self {
        SocketId(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity a connection has established, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Principal {
    /// Signature-authenticated but carrying no user identity.
    Anonymous,
    /// Presence-authenticated user.
    User {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<Value>,
    },
}

/// One live client connection.
pub struct Connection {
    socket_id: SocketId,
    app: App,
    remote_address: String,
    principal: RwLock<Option<Principal>>,
    subscriptions: Mutex<HashSet<String>>,
    last_pong: Mutex<Instant>,
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
}

impl Connection {
    /// Creates a connection and the receiving end of its outbound queue.
    /// The caller owns the receiver and drains it into the socket sink.
    pub fn new(
        socket_id: SocketId,
        app: App,
        remote_address: String,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let connection = Connection {
            socket_id,
            app,
            remote_address,
            principal: RwLock::new(None),
            subscriptions: Mutex::new(HashSet::new()),
            last_pong: Mutex::new(Instant::now()),
            outbound: tx,
            closed: AtomicBool::new(false),
        };
        (connection, rx)
    }

    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Queues a UTF-8 JSON text frame. Frames sent after close, or while the
    /// queue is saturated, are silently dropped.
    pub fn send_text(&self, frame: String) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.outbound.try_send(Message::Text(frame)).is_err() {
            trace!(socket_id = %self.socket_id, "outbound frame dropped");
        }
    }

    /// Queues a pong control frame in response to a transport-level ping.
    pub fn send_pong(&self, payload: Vec<u8>) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.outbound.try_send(Message::Pong(payload));
    }

    /// Queues a close frame and marks the sink closed. Idempotent; frames
    /// queued afterwards are dropped.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.try_send(Message::Close(Some(frame)));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn principal(&self) -> Option<Principal> {
        self.principal.read().unwrap().clone()
    }

    pub fn set_principal(&self, principal: Principal) {
        let mut current = self.principal.write().unwrap();
        // A named identity is never downgraded back to anonymous.
        match (&*current, &principal) {
            (Some(Principal::User { .. }), Principal::Anonymous) => {}
            _ => *current = Some(principal),
        }
    }

    pub fn clear_principal(&self) {
        *self.principal.write().unwrap() = None;
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.lock().unwrap().contains(channel)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().iter().cloned().collect()
    }

    pub(crate) fn record_subscription(&self, channel: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(channel.to_string());
    }

    pub(crate) fn forget_subscription(&self, channel: &str) {
        self.subscriptions.lock().unwrap().remove(channel);
    }

    pub fn touch_pong(&self) {
        *self.last_pong.lock().unwrap() = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("socket_id", &self.socket_id)
            .field("app", &self.app.id)
            .field("remote_address", &self.remote_address)
            .finish()
    }
}
