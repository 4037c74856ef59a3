//! Client-event policy tests: relaying between subscribers, the app-level
//! enable flag, and the sender-exclusion contract.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;

#[tokio::test]
async fn client_event_reaches_other_subscribers_but_not_sender() {
    let broker = start_broker(vec![test_app()]).await;

    let mut alice = connect(&broker, "test-key").await;
    established(&mut alice).await;
    subscribe(&mut alice, "broadcast-channel").await;

    let mut bob = connect(&broker, "test-key").await;
    established(&mut bob).await;
    subscribe(&mut bob, "broadcast-channel").await;

    send_json(
        &mut alice,
        &json!({
            "event": "client-hello",
            "data": {"message": "Hi"},
            "channel": "broadcast-channel",
        }),
    )
    .await;

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["event"], "client-hello");
    assert_eq!(frame["channel"], "broadcast-channel");
    assert_eq!(frame["data"]["message"], "Hi");

    // The sender receives nothing in response.
    assert_silent(&mut alice, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn disabled_client_messages_produce_no_frames_at_all() {
    let mut app = test_app();
    app.client_messages_enabled = false;
    let broker = start_broker(vec![app]).await;

    let mut alice = connect(&broker, "test-key").await;
    established(&mut alice).await;
    subscribe(&mut alice, "room").await;

    let mut bob = connect(&broker, "test-key").await;
    established(&mut bob).await;
    subscribe(&mut bob, "room").await;

    send_json(
        &mut alice,
        &json!({"event": "client-hello", "data": {}, "channel": "room"}),
    )
    .await;

    assert_silent(&mut alice, Duration::from_millis(300)).await;
    assert_silent(&mut bob, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn client_event_on_unsubscribed_channel_is_dropped() {
    let broker = start_broker(vec![test_app()]).await;

    let mut alice = connect(&broker, "test-key").await;
    established(&mut alice).await;
    subscribe(&mut alice, "mine").await;

    let mut bob = connect(&broker, "test-key").await;
    established(&mut bob).await;
    subscribe(&mut bob, "theirs").await;

    // Alice is not subscribed to "theirs": the frame goes nowhere.
    send_json(
        &mut alice,
        &json!({"event": "client-hello", "data": {}, "channel": "theirs"}),
    )
    .await;

    assert_silent(&mut bob, Duration::from_millis(300)).await;
    assert_silent(&mut alice, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn client_event_without_channel_is_dropped() {
    let broker = start_broker(vec![test_app()]).await;

    let mut ws = connect(&broker, "test-key").await;
    established(&mut ws).await;
    subscribe(&mut ws, "room").await;

    send_json(&mut ws, &json!({"event": "client-hello", "data": {}})).await;
    assert_silent(&mut ws, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn frames_arrive_in_the_order_they_were_sent() {
    let broker = start_broker(vec![test_app()]).await;

    let mut sender = connect(&broker, "test-key").await;
    established(&mut sender).await;
    subscribe(&mut sender, "room").await;

    let mut receiver = connect(&broker, "test-key").await;
    established(&mut receiver).await;
    subscribe(&mut receiver, "room").await;

    for seq in 0..20 {
        send_json(
            &mut sender,
            &json!({"event": "client-seq", "channel": "room", "data": {"seq": seq}}),
        )
        .await;
    }

    for seq in 0..20 {
        let frame = next_json(&mut receiver).await;
        assert_eq!(frame["data"]["seq"], seq, "out-of-order delivery");
    }
}

#[tokio::test]
async fn client_events_fan_out_to_all_other_members() {
    let broker = start_broker(vec![test_app()]).await;

    let mut sender = connect(&broker, "test-key").await;
    established(&mut sender).await;
    subscribe(&mut sender, "room").await;

    let mut receivers = Vec::new();
    for _ in 0..3 {
        let mut ws = connect(&broker, "test-key").await;
        established(&mut ws).await;
        subscribe(&mut ws, "room").await;
        receivers.push(ws);
    }

    send_json(
        &mut sender,
        &json!({"event": "client-ping-all", "data": {"seq": 7}, "channel": "room"}),
    )
    .await;

    for ws in receivers.iter_mut() {
        let frame = next_json(ws).await;
        assert_eq!(frame["event"], "client-ping-all");
        assert_eq!(frame["data"]["seq"], 7);
    }
    assert_silent(&mut sender, Duration::from_millis(200)).await;
}
