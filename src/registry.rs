//! Channel Registry
//!
//! Process-wide owner of per-app channels and live connections. Channel
//! membership and the connection's own subscription set are updated under
//! one lock so they can never disagree. The lock is only held for map
//! mutation and snapshotting; frames are queued on the per-connection
//! sinks after it is released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::auth;
use crate::channel::{Channel, ChannelType, PresenceMember};
use crate::connection::{Connection, Principal, SocketId};
use crate::error::{BrokerError, Result};
use crate::protocol;
use crate::protocol::SubscribePayload;

#[derive(Default)]
struct AppState {
    channels: HashMap<String, Channel>,
    connections: HashMap<SocketId, Arc<Connection>>,
}

/// Registry of channels and connections for every app on this node.
pub struct ChannelRegistry {
    state: RwLock<HashMap<String, AppState>>,
    accepting: AtomicBool,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry {
            state: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn accepts_new_connections(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Flips the admission gate; used when draining before a restart.
    pub fn decline_new_connections(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Registers a live connection. Fails when the socket id is already in
    /// use, in which case the caller generates a fresh id and retries.
    pub fn register_connection(&self, connection: Arc<Connection>) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let app_state = state
            .entry(connection.app().id.clone())
            .or_default();
        if app_state.connections.contains_key(connection.socket_id()) {
            return Err(BrokerError::Config(format!(
                "socket id {} already registered",
                connection.socket_id()
            )));
        }
        app_state
            .connections
            .insert(connection.socket_id().clone(), connection);
        Ok(())
    }

    /// Removes a connection after its subscriptions have been torn down.
    pub fn remove_connection(&self, app_id: &str, socket_id: &SocketId) {
        let mut state = self.state.write().unwrap();
        if let Some(app_state) = state.get_mut(app_id) {
            app_state.connections.remove(socket_id);
            if app_state.connections.is_empty() && app_state.channels.is_empty() {
                state.remove(app_id);
            }
        }
    }

    pub fn find_connection(&self, app_id: &str, socket_id: &SocketId) -> Option<Arc<Connection>> {
        let state = self.state.read().unwrap();
        state.get(app_id)?.connections.get(socket_id).cloned()
    }

    /// Live connections for one app, or for the whole node.
    pub fn local_connections(&self, app_id: Option<&str>) -> Vec<Arc<Connection>> {
        let state = self.state.read().unwrap();
        match app_id {
            Some(app_id) => state
                .get(app_id)
                .map(|s| s.connections.values().cloned().collect())
                .unwrap_or_default(),
            None => state
                .values()
                .flat_map(|s| s.connections.values().cloned())
                .collect(),
        }
    }

    pub fn global_connections_count(&self, app_id: &str) -> usize {
        let state = self.state.read().unwrap();
        state.get(app_id).map(|s| s.connections.len()).unwrap_or(0)
    }

    /// Subscribes a connection to a channel, validating the signature for
    /// private and presence channels. Re-subscribing is a no-op.
    pub fn subscribe(&self, connection: &Arc<Connection>, payload: &SubscribePayload) -> Result<()> {
        let app = connection.app();
        let channel_name = payload.channel.as_str();
        let kind = ChannelType::from_name(channel_name);

        auth::verify_subscription(
            app,
            connection.socket_id(),
            channel_name,
            payload.auth.as_deref(),
            payload.channel_data.as_deref(),
        )?;

        let presence_member = if kind == ChannelType::Presence {
            Some(parse_presence_member(payload.channel_data.as_deref())?)
        } else {
            None
        };

        let mut announcements: Vec<(Arc<Connection>, String)> = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            let app_state = state.entry(app.id.clone()).or_default();
            let channel = app_state
                .channels
                .entry(channel_name.to_string())
                .or_insert_with(|| Channel::new(channel_name));

            if channel.contains(connection.socket_id()) {
                debug!(socket_id = %connection.socket_id(), channel = %channel_name, "already subscribed");
                return Ok(());
            }

            channel.add(connection.socket_id().clone());
            connection.record_subscription(channel_name);

            match &presence_member {
                Some(member) => {
                    let first_for_user =
                        channel.add_presence_member(connection.socket_id().clone(), member.clone());
                    let payload = channel.presence_payload();
                    announcements.push((
                        connection.clone(),
                        protocol::subscription_succeeded(channel_name, Some(payload)),
                    ));
                    if first_for_user {
                        let frame = protocol::member_added(channel_name, member);
                        for socket_id in channel.connection_ids() {
                            if socket_id == connection.socket_id() {
                                continue;
                            }
                            if let Some(other) = app_state.connections.get(socket_id) {
                                announcements.push((other.clone(), frame.clone()));
                            }
                        }
                    }
                }
                None => {
                    announcements.push((
                        connection.clone(),
                        protocol::subscription_succeeded(channel_name, None),
                    ));
                }
            }
        }

        match presence_member {
            Some(member) => connection.set_principal(Principal::User {
                id: member.user_id,
                info: member.user_info,
            }),
            None if kind == ChannelType::Private => {
                connection.set_principal(Principal::Anonymous)
            }
            None => {}
        }

        for (target, frame) in announcements {
            target.send_text(frame);
        }
        Ok(())
    }

    /// Unsubscribes a connection from a channel. Unsubscribing a channel the
    /// connection is not in is a no-op.
    pub fn unsubscribe(&self, connection: &Arc<Connection>, channel_name: &str) {
        let mut announcements: Vec<(Arc<Connection>, String)> = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            let app_state = match state.get_mut(&connection.app().id) {
                Some(app_state) => app_state,
                None => return,
            };
            let channel = match app_state.channels.get_mut(channel_name) {
                Some(channel) => channel,
                None => return,
            };

            let departed_member = channel.remove_presence_member(connection.socket_id());
            if !channel.remove(connection.socket_id()) {
                return;
            }
            connection.forget_subscription(channel_name);

            if let Some(member) = departed_member {
                let frame = protocol::member_removed(channel_name, &member.user_id);
                for socket_id in channel.connection_ids() {
                    if let Some(other) = app_state.connections.get(socket_id) {
                        announcements.push((other.clone(), frame.clone()));
                    }
                }
            }

            if channel.is_empty() {
                app_state.channels.remove(channel_name);
                debug!(channel = %channel_name, "channel destroyed");
            }
        }

        for (target, frame) in announcements {
            target.send_text(frame);
        }
    }

    /// Tears down every subscription a closing connection still holds.
    pub fn unsubscribe_from_all(&self, connection: &Arc<Connection>) {
        for channel in connection.subscriptions() {
            self.unsubscribe(connection, &channel);
        }
    }

    /// Queues a frame to every member of a channel except the given socket
    /// ids. Returns the number of connections the frame was queued for.
    pub fn broadcast(
        &self,
        app_id: &str,
        channel_name: &str,
        frame: &str,
        except: &HashSet<SocketId>,
    ) -> usize {
        let recipients = self.members_snapshot(app_id, channel_name, except);
        let count = recipients.len();
        for target in recipients {
            target.send_text(frame.to_string());
        }
        count
    }

    /// Queues a frame to the subset of a channel's members with the given
    /// socket ids, or to any local connection of the app when no channel is
    /// named. Returns the number of connections reached.
    pub fn whisper(
        &self,
        app_id: &str,
        channel_name: Option<&str>,
        socket_ids: &[SocketId],
        frame: &str,
    ) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let state = self.state.read().unwrap();
            let app_state = match state.get(app_id) {
                Some(app_state) => app_state,
                None => return 0,
            };
            match channel_name {
                Some(name) => match app_state.channels.get(name) {
                    Some(channel) => socket_ids
                        .iter()
                        .filter(|&sid| channel.contains(sid))
                        .filter_map(|sid| app_state.connections.get(sid).cloned())
                        .collect(),
                    None => Vec::new(),
                },
                None => socket_ids
                    .iter()
                    .filter_map(|sid| app_state.connections.get(sid).cloned())
                    .collect(),
            }
        };

        let count = targets.len();
        for target in targets {
            target.send_text(frame.to_string());
        }
        count
    }

    fn members_snapshot(
        &self,
        app_id: &str,
        channel_name: &str,
        except: &HashSet<SocketId>,
    ) -> Vec<Arc<Connection>> {
        let state = self.state.read().unwrap();
        let app_state = match state.get(app_id) {
            Some(app_state) => app_state,
            None => return Vec::new(),
        };
        let channel = match app_state.channels.get(channel_name) {
            Some(channel) => channel,
            None => return Vec::new(),
        };
        channel
            .connection_ids()
            .filter(|&sid| !except.contains(sid))
            .filter_map(|sid| app_state.connections.get(sid).cloned())
            .collect()
    }

    pub fn find_channel_connection_count(&self, app_id: &str, channel_name: &str) -> Option<usize> {
        let state = self.state.read().unwrap();
        state
            .get(app_id)?
            .channels
            .get(channel_name)
            .map(|c| c.connection_count())
    }

    /// Occupied channels of an app with their connection counts.
    pub fn channels_overview(&self, app_id: &str) -> Vec<(String, usize)> {
        let state = self.state.read().unwrap();
        state
            .get(app_id)
            .map(|app_state| {
                app_state
                    .channels
                    .values()
                    .map(|c| (c.name.clone(), c.connection_count()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct presence members of a presence channel.
    pub fn presence_users(&self, app_id: &str, channel_name: &str) -> Option<Vec<PresenceMember>> {
        let state = self.state.read().unwrap();
        state
            .get(app_id)?
            .channels
            .get(channel_name)
            .map(|c| c.presence_members())
    }

    /// App ids that currently have an occupied channel with this name.
    /// The control plane resolves broadcast targets with this.
    pub fn apps_with_channel(&self, channel_name: &str) -> Vec<String> {
        let state = self.state.read().unwrap();
        state
            .iter()
            .filter(|(_, app_state)| app_state.channels.contains_key(channel_name))
            .map(|(app_id, _)| app_id.clone())
            .collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_presence_member(channel_data: Option<&str>) -> Result<PresenceMember> {
    let raw = channel_data.ok_or(BrokerError::PresenceDataMissing)?;
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|_| BrokerError::MalformedFrame("invalid presence channel_data".to_string()))?;
    let user_id = match value.get("user_id") {
        Some(serde_json::Value::String(id)) => id.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(BrokerError::PresenceDataMissing),
    };
    Ok(PresenceMember {
        user_id,
        user_info: value.get("user_info").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn test_app() -> App {
        App {
            id: "1".to_string(),
            key: "key".to_string(),
            secret: "secret".to_string(),
            name: "test".to_string(),
            capacity: Some(2),
            client_messages_enabled: true,
            statistics_enabled: true,
            allowed_origins: Vec::new(),
        }
    }

    fn connect(registry: &ChannelRegistry) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (conn, rx) = Connection::new(SocketId::generate(), test_app(), "peer".into());
        let conn = Arc::new(conn);
        registry.register_connection(conn.clone()).unwrap();
        (conn, rx)
    }

    fn subscribe_payload(channel: &str) -> SubscribePayload {
        SubscribePayload {
            channel: channel.to_string(),
            auth: None,
            channel_data: None,
        }
    }

    fn presence_payload(conn: &Connection, user_id: &str) -> SubscribePayload {
        let data = serde_json::json!({ "user_id": user_id }).to_string();
        let auth = auth::subscription_auth(
            conn.app(),
            conn.socket_id(),
            "presence-chat",
            Some(&data),
        );
        SubscribePayload {
            channel: "presence-chat".to_string(),
            auth: Some(auth),
            channel_data: Some(data),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                frames.push(serde_json::from_str(&text).unwrap());
            }
        }
        frames
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let registry = ChannelRegistry::new();
        let (conn, mut rx) = connect(&registry);

        registry.subscribe(&conn, &subscribe_payload("room")).unwrap();
        registry.subscribe(&conn, &subscribe_payload("room")).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "pusher_internal:subscription_succeeded");
        assert_eq!(registry.find_channel_connection_count("1", "room"), Some(1));
    }

    #[tokio::test]
    async fn membership_invariant_holds() {
        let registry = ChannelRegistry::new();
        let (conn, _rx) = connect(&registry);

        registry.subscribe(&conn, &subscribe_payload("room")).unwrap();
        assert!(conn.is_subscribed("room"));
        assert_eq!(registry.find_channel_connection_count("1", "room"), Some(1));

        registry.unsubscribe(&conn, "room");
        assert!(!conn.is_subscribed("room"));
        assert_eq!(registry.find_channel_connection_count("1", "room"), None);
    }

    #[tokio::test]
    async fn empty_channels_are_destroyed() {
        let registry = ChannelRegistry::new();
        let (a, _rx_a) = connect(&registry);
        let (b, _rx_b) = connect(&registry);

        registry.subscribe(&a, &subscribe_payload("room")).unwrap();
        registry.subscribe(&b, &subscribe_payload("room")).unwrap();
        registry.unsubscribe(&a, "room");
        assert_eq!(registry.find_channel_connection_count("1", "room"), Some(1));
        registry.unsubscribe(&b, "room");
        assert!(registry.channels_overview("1").is_empty());
    }

    #[tokio::test]
    async fn broadcast_honors_except_set() {
        let registry = ChannelRegistry::new();
        let (a, mut rx_a) = connect(&registry);
        let (b, mut rx_b) = connect(&registry);
        let (c, mut rx_c) = connect(&registry);

        for conn in [&a, &b, &c] {
            registry.subscribe(conn, &subscribe_payload("room")).unwrap();
        }
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        let mut except = HashSet::new();
        except.insert(a.socket_id().clone());
        let sent = registry.broadcast("1", "room", r#"{"event":"x"}"#, &except);

        assert_eq!(sent, 2);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(drain(&mut rx_c).len(), 1);
    }

    #[tokio::test]
    async fn presence_member_added_once_per_user() {
        let registry = ChannelRegistry::new();
        let (a, mut rx_a) = connect(&registry);
        let (b, mut rx_b) = connect(&registry);
        let (c, _rx_c) = connect(&registry);

        registry.subscribe(&a, &presence_payload(&a, "u1")).unwrap();
        drain(&mut rx_a);

        // Second connection of the same user: members see no announcement.
        registry.subscribe(&b, &presence_payload(&b, "u1")).unwrap();
        assert!(drain(&mut rx_a).is_empty());
        let b_frames = drain(&mut rx_b);
        assert_eq!(b_frames.len(), 1);
        assert_eq!(
            b_frames[0]["event"],
            "pusher_internal:subscription_succeeded"
        );

        // A different user joining is announced to both.
        registry.subscribe(&c, &presence_payload(&c, "u2")).unwrap();
        let a_frames = drain(&mut rx_a);
        assert_eq!(a_frames.len(), 1);
        assert_eq!(a_frames[0]["event"], "pusher_internal:member_added");
    }

    #[tokio::test]
    async fn presence_member_removed_on_last_departure() {
        let registry = ChannelRegistry::new();
        let (a, mut rx_a) = connect(&registry);
        let (b, _rx_b) = connect(&registry);
        let (c, _rx_c) = connect(&registry);

        registry.subscribe(&a, &presence_payload(&a, "observer")).unwrap();
        registry.subscribe(&b, &presence_payload(&b, "u1")).unwrap();
        registry.subscribe(&c, &presence_payload(&c, "u1")).unwrap();
        drain(&mut rx_a);

        registry.unsubscribe(&b, "presence-chat");
        assert!(drain(&mut rx_a).is_empty());

        registry.unsubscribe(&c, "presence-chat");
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "pusher_internal:member_removed");
    }

    #[tokio::test]
    async fn presence_subscribe_sets_principal() {
        let registry = ChannelRegistry::new();
        let (conn, _rx) = connect(&registry);

        registry.subscribe(&conn, &presence_payload(&conn, "u1")).unwrap();
        match conn.principal() {
            Some(Principal::User { id, .. }) => assert_eq!(id, "u1"),
            other => panic!("unexpected principal: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_auth_does_not_join_channel() {
        let registry = ChannelRegistry::new();
        let (conn, _rx) = connect(&registry);

        let payload = SubscribePayload {
            channel: "private-room".to_string(),
            auth: Some("key:badsignature".to_string()),
            channel_data: None,
        };
        assert!(registry.subscribe(&conn, &payload).is_err());
        assert!(!conn.is_subscribed("private-room"));
        assert_eq!(
            registry.find_channel_connection_count("1", "private-room"),
            None
        );
    }

    #[tokio::test]
    async fn unsubscribe_from_all_clears_everything() {
        let registry = ChannelRegistry::new();
        let (conn, _rx) = connect(&registry);

        registry.subscribe(&conn, &subscribe_payload("one")).unwrap();
        registry.subscribe(&conn, &subscribe_payload("two")).unwrap();
        registry.unsubscribe_from_all(&conn);

        assert!(conn.subscriptions().is_empty());
        assert!(registry.channels_overview("1").is_empty());
    }

    #[tokio::test]
    async fn whisper_targets_channel_members_only() {
        let registry = ChannelRegistry::new();
        let (a, mut rx_a) = connect(&registry);
        let (b, mut rx_b) = connect(&registry);

        registry.subscribe(&a, &subscribe_payload("room")).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let sent = registry.whisper(
            "1",
            Some("room"),
            &[a.socket_id().clone(), b.socket_id().clone()],
            r#"{"event":"psst"}"#,
        );
        assert_eq!(sent, 1);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn capacity_counting_and_admission_gate() {
        let registry = ChannelRegistry::new();
        assert!(registry.accepts_new_connections());
        assert_eq!(registry.global_connections_count("1"), 0);

        let (_a, _rx_a) = connect(&registry);
        let (_b, _rx_b) = connect(&registry);
        assert_eq!(registry.global_connections_count("1"), 2);

        registry.decline_new_connections();
        assert!(!registry.accepts_new_connections());
    }

    #[tokio::test]
    async fn duplicate_socket_id_rejected() {
        let registry = ChannelRegistry::new();
        let id = SocketId::generate();
        let (first, _rx1) = Connection::new(id.clone(), test_app(), "peer".into());
        let (second, _rx2) = Connection::new(id, test_app(), "peer".into());

        registry.register_connection(Arc::new(first)).unwrap();
        assert!(registry.register_connection(Arc::new(second)).is_err());
    }

    #[tokio::test]
    async fn apps_with_channel_resolves_across_apps() {
        let registry = ChannelRegistry::new();
        let (conn, _rx) = connect(&registry);
        registry.subscribe(&conn, &subscribe_payload("public-chat")).unwrap();

        assert_eq!(registry.apps_with_channel("public-chat"), vec!["1"]);
        assert!(registry.apps_with_channel("nothing").is_empty());
    }
}
