//! Dispatch integration tests: controllers registered under kebab-case
//! namespaces, exercised end-to-end over WebSocket connections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use crest::connection::SocketId;
use crest::dispatch::{Controller, DispatchContext, HandlerValue};
use crest::error::{BrokerError, Result};
use crest::resolver::ControllerRegistry;
use serde_json::{json, Value};

struct EchoBoxController;

#[async_trait]
impl Controller for EchoBoxController {
    fn requires_authentication(&self) -> bool {
        false
    }

    async fn handle(
        &self,
        method: &str,
        ctx: &DispatchContext,
        data: Value,
    ) -> Result<HandlerValue> {
        match method {
            "say" => Ok(HandlerValue::Value(json!({"echo": data}))),
            "steps" => {
                ctx.progress(json!({"step": "validate"}));
                ctx.progress(json!({"step": "persist"}));
                Ok(HandlerValue::Value(json!({"status": "done"})))
            }
            "shout" => {
                ctx.broadcast(data, None, false);
                Ok(HandlerValue::Handled)
            }
            "relay" => {
                let targets: Vec<SocketId> = data["targets"]
                    .as_array()
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|v| v.as_str())
                            .map(|s| SocketId::from_string(s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                ctx.whisper(json!({"from": ctx.socket_id().as_str()}), &targets, None);
                Ok(HandlerValue::Value(json!({"delivered": targets.len()})))
            }
            "boom" => Err(BrokerError::HandlerFailed("database unavailable".into())),
            _ => Err(BrokerError::MethodNotFound),
        }
    }
}

struct VaultController;

#[async_trait]
impl Controller for VaultController {
    async fn handle(
        &self,
        _method: &str,
        ctx: &DispatchContext,
        _data: Value,
    ) -> Result<HandlerValue> {
        let user = match ctx.principal() {
            Some(crest::connection::Principal::User { id, .. }) => id.clone(),
            Some(crest::connection::Principal::Anonymous) => "anonymous".to_string(),
            None => unreachable!("gate rejects missing principal"),
        };
        Ok(HandlerValue::Value(json!({"user": user})))
    }
}

fn controllers() -> ControllerRegistry {
    let registry = ControllerRegistry::new();
    registry.register("EchoBoxController", Arc::new(EchoBoxController));
    registry.register("VaultController", Arc::new(VaultController));
    registry
}

async fn start_dispatch_broker() -> TestBroker {
    start_broker_with(vec![test_app()], controllers(), |_| {}).await
}

#[tokio::test]
async fn dispatched_event_returns_response() {
    let broker = start_dispatch_broker().await;
    let mut ws = connect(&broker, "test-key").await;
    established(&mut ws).await;
    subscribe(&mut ws, "room").await;

    send_json(
        &mut ws,
        &json!({"event": "echo-box.say", "channel": "room", "data": {"text": "hi"}}),
    )
    .await;

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "echo-box.say:response");
    assert_eq!(frame["data"]["echo"]["text"], "hi");
}

#[tokio::test]
async fn progress_envelopes_precede_response() {
    let broker = start_dispatch_broker().await;
    let mut ws = connect(&broker, "test-key").await;
    established(&mut ws).await;

    send_json(&mut ws, &json!({"event": "echo-box.steps", "data": {}})).await;

    let first = next_json(&mut ws).await;
    assert_eq!(first["event"], "echo-box.steps:progress");
    assert_eq!(first["data"]["step"], "validate");
    let second = next_json(&mut ws).await;
    assert_eq!(second["data"]["step"], "persist");
    let last = next_json(&mut ws).await;
    assert_eq!(last["event"], "echo-box.steps:response");
    assert_eq!(last["data"]["status"], "done");
}

#[tokio::test]
async fn unknown_namespace_is_reported() {
    let broker = start_dispatch_broker().await;
    let mut ws = connect(&broker, "test-key").await;
    established(&mut ws).await;

    send_json(&mut ws, &json!({"event": "ghost.walk", "data": {}})).await;

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "ghost.walk:error");
    assert_eq!(frame["data"]["message"], "Event could not be associated");
}

#[tokio::test]
async fn unknown_method_is_reported() {
    let broker = start_dispatch_broker().await;
    let mut ws = connect(&broker, "test-key").await;
    established(&mut ws).await;

    send_json(&mut ws, &json!({"event": "echo-box.missing", "data": {}})).await;

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["data"]["message"], "Event could not be handled");
}

#[tokio::test]
async fn handler_error_is_reported_with_meta() {
    let broker = start_dispatch_broker().await;
    let mut ws = connect(&broker, "test-key").await;
    established(&mut ws).await;

    send_json(&mut ws, &json!({"event": "echo-box.boom", "data": {}})).await;

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "echo-box.boom:error");
    assert_eq!(frame["data"]["message"], "database unavailable");
    assert_eq!(frame["data"]["meta"]["reported"], true);
}

#[tokio::test]
async fn guarded_controller_rejects_anonymous_connections() {
    let broker = start_dispatch_broker().await;
    let mut ws = connect(&broker, "test-key").await;
    established(&mut ws).await;

    send_json(&mut ws, &json!({"event": "vault.open", "data": {}})).await;

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "vault.open:error");
    assert_eq!(frame["data"]["message"], "Unauthorized");
}

#[tokio::test]
async fn guarded_controller_accepts_presence_principal() {
    let broker = start_dispatch_broker().await;
    let mut ws = connect(&broker, "test-key").await;
    let socket_id = established(&mut ws).await;

    let channel_data = json!({"user_id": "u1"}).to_string();
    let sig = crest::auth::subscription_auth(
        &test_app(),
        &SocketId::from_string(socket_id),
        "presence-lobby",
        Some(&channel_data),
    );
    send_json(
        &mut ws,
        &json!({
            "event": "pusher:subscribe",
            "data": {
                "channel": "presence-lobby",
                "auth": sig,
                "channel_data": channel_data,
            },
        }),
    )
    .await;
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher_internal:subscription_succeeded");

    send_json(&mut ws, &json!({"event": "vault.open", "data": {}})).await;
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "vault.open:response");
    assert_eq!(frame["data"]["user"], "u1");
}

#[tokio::test]
async fn broadcast_envelope_reaches_channel_members() {
    let broker = start_dispatch_broker().await;

    let mut alice = connect(&broker, "test-key").await;
    established(&mut alice).await;
    subscribe(&mut alice, "room").await;

    let mut bob = connect(&broker, "test-key").await;
    established(&mut bob).await;
    subscribe(&mut bob, "room").await;

    send_json(
        &mut alice,
        &json!({"event": "echo-box.shout", "channel": "room", "data": {"text": "all hands"}}),
    )
    .await;

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["event"], "echo-box.shout");
    assert_eq!(frame["channel"], "room");
    assert_eq!(frame["data"]["text"], "all hands");

    // Sender is excluded and the Handled sentinel suppressed the response.
    assert_silent(&mut alice, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn whisper_envelope_targets_specific_sockets() {
    let broker = start_dispatch_broker().await;

    let mut alice = connect(&broker, "test-key").await;
    established(&mut alice).await;

    let mut bob = connect(&broker, "test-key").await;
    let bob_id = established(&mut bob).await;

    let mut carol = connect(&broker, "test-key").await;
    established(&mut carol).await;

    send_json(
        &mut alice,
        &json!({"event": "echo-box.relay", "data": {"targets": [bob_id]}}),
    )
    .await;

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["event"], "echo-box.relay");

    let response = next_json(&mut alice).await;
    assert_eq!(response["event"], "echo-box.relay:response");
    assert_eq!(response["data"]["delivered"], 1);

    assert_silent(&mut carol, Duration::from_millis(300)).await;
}
