//! Dispatch Engine
//!
//! Routes application events (`<namespace>.<method>`) to registered
//! controllers. Each dispatch runs in its own task with its own context
//! snapshot, so concurrent dispatches never observe each other's principal
//! or scoped state, and the connection loop never waits on a handler.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::app::App;
use crate::connection::{Connection, Principal, SocketId};
use crate::error::{BrokerError, Result};
use crate::metrics::BrokerMetrics;
use crate::protocol;
use crate::registry::ChannelRegistry;
use crate::resolver::ControllerRegistry;

/// A dispatch that has produced no terminal envelope after this long gets a
/// synthetic `<event>:error` timeout reply. The handler task keeps running;
/// anything it emits later is delivered as a late envelope.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Flow control returned by the `boot` / `booted` hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    Continue,
    /// Halt the dispatch without replying.
    Stop,
}

/// What a handler method produced.
#[derive(Debug)]
pub enum HandlerValue {
    /// A plain value, emitted as the terminal `<event>:response`.
    Value(Value),
    /// The handler already emitted its own envelopes; suppress the
    /// automatic response.
    Handled,
}

/// A server-side event controller covering one event namespace.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Whether dispatches require an authenticated principal.
    fn requires_authentication(&self) -> bool {
        true
    }

    /// Runs before the authentication gate.
    async fn boot(&self, _ctx: &DispatchContext) -> HookFlow {
        HookFlow::Continue
    }

    /// Runs after the authentication gate, before the method.
    async fn booted(&self, _ctx: &DispatchContext) -> HookFlow {
        HookFlow::Continue
    }

    /// Best-effort cleanup after the method, regardless of its outcome.
    async fn unboot(&self, _ctx: &DispatchContext) {}

    /// Executes one method of the namespace. Unknown methods return
    /// `Err(BrokerError::MethodNotFound)`.
    async fn handle(&self, method: &str, ctx: &DispatchContext, data: Value)
        -> Result<HandlerValue>;
}

/// Per-dispatch context: a snapshot of the originating connection plus the
/// reply sink. Handlers hold only this, never the connection itself.
pub struct DispatchContext {
    event: String,
    channel: Option<String>,
    socket_id: SocketId,
    app: App,
    principal: Option<Principal>,
    origin: Arc<Connection>,
    registry: Arc<ChannelRegistry>,
    terminal_sent: AtomicBool,
}

impl DispatchContext {
    fn new(
        event: String,
        channel: Option<String>,
        connection: &Arc<Connection>,
        registry: Arc<ChannelRegistry>,
    ) -> Self {
        DispatchContext {
            event,
            channel,
            socket_id: connection.socket_id().clone(),
            app: connection.app().clone(),
            principal: connection.principal(),
            origin: connection.clone(),
            registry,
            terminal_sent: AtomicBool::new(false),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    /// The principal captured when the dispatch was scheduled.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Emits the terminal `<event>:response` envelope to the origin.
    pub fn success(&self, payload: Value) {
        self.terminal_sent.store(true, Ordering::SeqCst);
        self.origin
            .send_text(protocol::event_response(&self.event, &payload));
    }

    /// Emits an intermediate `<event>:progress` envelope to the origin.
    pub fn progress(&self, payload: Value) {
        self.origin
            .send_text(protocol::event_progress(&self.event, &payload));
    }

    /// Emits the terminal `<event>:error` envelope to the origin.
    pub fn error(&self, payload: Value) {
        self.terminal_sent.store(true, Ordering::SeqCst);
        self.origin
            .send_text(protocol::event_error_payload(&self.event, &payload));
    }

    fn error_message(&self, message: &str, reported: bool) {
        self.terminal_sent.store(true, Ordering::SeqCst);
        self.origin
            .send_text(protocol::event_error(&self.event, message, reported));
    }

    fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    /// Broadcasts a payload to the named channel, defaulting to the channel
    /// the event arrived on. The sender is excluded unless `including_self`.
    /// Returns the number of connections reached.
    pub fn broadcast(&self, payload: Value, channel: Option<&str>, including_self: bool) -> usize {
        let channel = match channel.or(self.channel.as_deref()) {
            Some(channel) => channel,
            None => {
                warn!(event = %self.event, "broadcast envelope without a channel");
                return 0;
            }
        };
        let frame = protocol::channel_event(&self.event, channel, &payload);
        let mut except = HashSet::new();
        if !including_self {
            except.insert(self.socket_id.clone());
        }
        self.registry
            .broadcast(&self.app.id, channel, &frame, &except)
    }

    /// Whispers a payload to specific live connections, optionally limited
    /// to members of a channel. Returns the number of connections reached.
    pub fn whisper(&self, payload: Value, socket_ids: &[SocketId], channel: Option<&str>) -> usize {
        let channel = channel.or(self.channel.as_deref());
        let frame = protocol::channel_event(&self.event, channel.unwrap_or(""), &payload);
        self.registry
            .whisper(&self.app.id, channel, socket_ids, &frame)
    }
}

/// The dispatch engine.
pub struct Dispatcher {
    controllers: Arc<ControllerRegistry>,
    registry: Arc<ChannelRegistry>,
    metrics: BrokerMetrics,
}

impl Dispatcher {
    pub fn new(
        controllers: Arc<ControllerRegistry>,
        registry: Arc<ChannelRegistry>,
        metrics: BrokerMetrics,
    ) -> Self {
        Dispatcher {
            controllers,
            registry,
            metrics,
        }
    }

    pub fn controllers(&self) -> &Arc<ControllerRegistry> {
        &self.controllers
    }

    /// Schedules one dispatch. Returns immediately; replies arrive on the
    /// connection's outbound queue as the handler produces them.
    pub fn dispatch(
        &self,
        connection: &Arc<Connection>,
        event: String,
        data: Value,
        channel: Option<String>,
    ) {
        let (prefix, method) = match event.split_once('.') {
            Some((prefix, method)) => (prefix.to_string(), method.to_string()),
            None => (event.clone(), String::new()),
        };

        let controller = match self.controllers.resolve(&prefix) {
            Some(controller) => controller,
            None => {
                debug!(event = %event, "no controller for event");
                connection.send_text(protocol::event_error(
                    &event,
                    &BrokerError::EventNotFound.to_string(),
                    false,
                ));
                return;
            }
        };

        let ctx = Arc::new(DispatchContext::new(
            event,
            channel,
            connection,
            self.registry.clone(),
        ));
        self.metrics.dispatches_total.inc();

        let metrics = self.metrics.clone();
        let run_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            run_dispatch(controller, run_ctx, &method, data, &metrics).await;
        });

        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(DISPATCH_TIMEOUT, task).await.is_err()
                && !ctx.terminal_sent()
            {
                warn!(event = %ctx.event, socket_id = %ctx.socket_id, "dispatch timed out");
                metrics.dispatch_timeouts.inc();
                let timeout_err = BrokerError::HandlerTimeout(ctx.event.clone());
                ctx.error_message(&timeout_err.to_string(), false);
            }
        });
    }
}

async fn run_dispatch(
    controller: Arc<dyn Controller>,
    ctx: Arc<DispatchContext>,
    method: &str,
    data: Value,
    metrics: &BrokerMetrics,
) {
    if controller.boot(&ctx).await == HookFlow::Stop {
        return;
    }

    if controller.requires_authentication() && ctx.principal().is_none() {
        ctx.error_message(&BrokerError::Unauthorized.to_string(), false);
        return;
    }

    if controller.booted(&ctx).await == HookFlow::Stop {
        return;
    }

    match controller.handle(method, &ctx, data).await {
        Ok(HandlerValue::Value(value)) => ctx.success(value),
        Ok(HandlerValue::Handled) => {}
        Err(err @ BrokerError::MethodNotFound) => {
            ctx.error_message(&err.to_string(), false);
        }
        Err(err) => {
            error!(event = %ctx.event, socket_id = %ctx.socket_id, error = %err, "handler failed");
            metrics.dispatch_errors.inc();
            ctx.error_message(&err.to_string(), true);
        }
    }

    controller.unboot(&ctx).await;
}
