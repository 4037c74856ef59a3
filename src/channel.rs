//! Channel types and membership state.
//!
//! A channel is a named membership set scoped to one app. The kind is
//! inferred from the name prefix: `private-` and `presence-` require an
//! auth signature on subscribe, presence channels additionally carry a
//! per-member `{user_id, user_info}` map.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::SocketId;

/// Channel kind derived from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Public,
    Private,
    Presence,
}

impl ChannelType {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("presence-") {
            ChannelType::Presence
        } else if name.starts_with("private-") {
            ChannelType::Private
        } else {
            ChannelType::Public
        }
    }

    /// Private and presence channels require a subscription signature.
    pub fn requires_auth(&self) -> bool {
        matches!(self, ChannelType::Private | ChannelType::Presence)
    }
}

/// A presence channel member as announced to other members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceMember {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

/// One channel's membership state.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub kind: ChannelType,
    connections: HashSet<SocketId>,
    presence: HashMap<SocketId, PresenceMember>,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Channel {
            name: name.to_string(),
            kind: ChannelType::from_name(name),
            connections: HashSet::new(),
            presence: HashMap::new(),
        }
    }

    pub fn contains(&self, socket_id: &SocketId) -> bool {
        self.connections.contains(socket_id)
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = &SocketId> {
        self.connections.iter()
    }

    /// Adds a connection. Returns false if it was already a member.
    pub fn add(&mut self, socket_id: SocketId) -> bool {
        self.connections.insert(socket_id)
    }

    /// Removes a connection. Returns false if it was not a member.
    pub fn remove(&mut self, socket_id: &SocketId) -> bool {
        self.presence.remove(socket_id);
        self.connections.remove(socket_id)
    }

    /// Records a presence member for a connection. Returns true when this is
    /// the first connection carrying that `user_id`, i.e. when a
    /// `member_added` event is due.
    pub fn add_presence_member(&mut self, socket_id: SocketId, member: PresenceMember) -> bool {
        let first_for_user = !self
            .presence
            .values()
            .any(|existing| existing.user_id == member.user_id);
        self.presence.insert(socket_id, member);
        first_for_user
    }

    /// Removes the presence entry for a connection. Returns the member when
    /// that was the last connection carrying its `user_id`, i.e. when a
    /// `member_removed` event is due.
    pub fn remove_presence_member(&mut self, socket_id: &SocketId) -> Option<PresenceMember> {
        let member = self.presence.remove(socket_id)?;
        let still_present = self
            .presence
            .values()
            .any(|existing| existing.user_id == member.user_id);
        if still_present {
            None
        } else {
            Some(member)
        }
    }

    pub fn presence_member(&self, socket_id: &SocketId) -> Option<&PresenceMember> {
        self.presence.get(socket_id)
    }

    /// Distinct presence members, one entry per `user_id`.
    pub fn presence_members(&self) -> Vec<PresenceMember> {
        let mut seen = HashSet::new();
        let mut members = Vec::new();
        for member in self.presence.values() {
            if seen.insert(member.user_id.clone()) {
                members.push(member.clone());
            }
        }
        members
    }

    /// The `{"presence": {"ids": [...], "hash": {...}, "count": N}}` payload
    /// sent inside `subscription_succeeded` for presence channels.
    pub fn presence_payload(&self) -> Value {
        let members = self.presence_members();
        let ids: Vec<&str> = members.iter().map(|m| m.user_id.as_str()).collect();
        let hash: serde_json::Map<String, Value> = members
            .iter()
            .map(|m| {
                (
                    m.user_id.clone(),
                    m.user_info.clone().unwrap_or(Value::Null),
                )
            })
            .collect();
        serde_json::json!({
            "presence": {
                "ids": ids,
                "hash": hash,
                "count": members.len(),
            }
        })
    }
}
