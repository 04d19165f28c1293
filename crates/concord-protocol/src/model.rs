//! Shared domain model.
//!
//! These types travel inside dispatch payloads and are persisted by the
//! server store; both sides of the wire agree on their JSON shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All domain entities are keyed by opaque 128-bit ids, comparable for
/// equality only.
pub type UserId = Uuid;
pub type ServerId = Uuid;
pub type ChannelId = Uuid;
pub type MessageId = Uuid;
pub type RoleId = Uuid;

/// Maximum message content length, in bytes of UTF-8.
pub const MAX_MESSAGE_BYTES: usize = 2000;
/// Channel names are 1..=100 bytes.
pub const MAX_CHANNEL_NAME_BYTES: usize = 100;

/// Presence status, as reported by clients and fanned out by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Online,
    Idle,
    Dnd,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub status: Status,
    #[serde(default)]
    pub status_text: String,
}

/// A guild. The owner holds every permission unconditionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub owner_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMember {
    pub user_id: UserId,
    pub server_id: ServerId,
    #[serde(default)]
    pub role_ids: Vec<RoleId>,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_until: Option<DateTime<Utc>>,
}

impl ServerMember {
    /// Whether the mute is in force right now. An expired `muted_until`
    /// counts as unmuted even if the flag was never cleared.
    pub fn muted_at(&self, now: DateTime<Utc>) -> bool {
        match (self.is_muted, self.muted_until) {
            (false, _) => false,
            (true, Some(until)) => until > now,
            (true, None) => true,
        }
    }
}

bitflags::bitflags! {
    /// Permission bits ORed across a member's roles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u64 {
        const ADMINISTRATOR   = 1 << 0;
        const MANAGE_SERVER   = 1 << 1;
        const MANAGE_CHANNELS = 1 << 2;
        const MANAGE_ROLES    = 1 << 3;
        const KICK_MEMBERS    = 1 << 4;
        const BAN_MEMBERS     = 1 << 5;
        const MUTE_MEMBERS    = 1 << 6;
        const SEND_MESSAGES   = 1 << 7;
    }
}

// On the wire permissions are a plain integer; unknown bits from newer
// peers are dropped rather than rejected.
impl Serialize for Permissions {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Ok(Permissions::from_bits_truncate(bits))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub server_id: ServerId,
    pub name: String,
    pub position: i32,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_hoisted: bool,
    #[serde(default)]
    pub color: i32,
    pub permissions: Permissions,
}

/// The effective permission set for a member holding `roles`.
///
/// Owners and administrators hold everything; everyone else gets the OR of
/// their role bits.
pub fn effective_permissions(is_owner: bool, roles: &[Role]) -> Permissions {
    if is_owner {
        return Permissions::all();
    }
    let folded = roles
        .iter()
        .fold(Permissions::empty(), |acc, r| acc | r.permissions);
    if folded.contains(Permissions::ADMINISTRATOR) {
        Permissions::all()
    } else {
        folded
    }
}

/// The member's highest hoisted role, used for member-list grouping.
/// Largest `position` wins; ties break on role id so the result is stable.
pub fn highest_hoisted_role(roles: &[Role]) -> Option<&Role> {
    roles
        .iter()
        .filter(|r| r.is_hoisted)
        .max_by(|a, b| a.position.cmp(&b.position).then(a.id.cmp(&b.id)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
    Category,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub server_id: ServerId,
    pub name: String,
    pub kind: ChannelKind,
    /// Set on leaves grouped under a category; always empty on categories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<ChannelId>,
    pub position: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Default,
    System,
}

/// Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    pub kind: MessageKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(position: i32, hoisted: bool, perms: Permissions) -> Role {
        Role {
            id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            name: format!("role-{position}"),
            position,
            is_default: false,
            is_hoisted: hoisted,
            color: 0,
            permissions: perms,
        }
    }

    #[test]
    fn effective_permissions_or_folds_roles() {
        let roles = vec![
            role(0, false, Permissions::SEND_MESSAGES),
            role(1, false, Permissions::MANAGE_CHANNELS),
        ];
        let perms = effective_permissions(false, &roles);
        assert!(perms.contains(Permissions::SEND_MESSAGES | Permissions::MANAGE_CHANNELS));
        assert!(!perms.contains(Permissions::BAN_MEMBERS));
    }

    #[test]
    fn owner_and_administrator_short_circuit_to_all() {
        assert_eq!(effective_permissions(true, &[]), Permissions::all());
        let roles = vec![role(0, false, Permissions::ADMINISTRATOR)];
        assert_eq!(effective_permissions(false, &roles), Permissions::all());
    }

    #[test]
    fn highest_hoisted_role_prefers_position_then_id() {
        let low = role(1, true, Permissions::empty());
        let high = role(5, true, Permissions::empty());
        let unhoisted = role(9, false, Permissions::empty());
        let roles = vec![low.clone(), high.clone(), unhoisted];
        assert_eq!(highest_hoisted_role(&roles).map(|r| r.id), Some(high.id));

        let mut a = role(3, true, Permissions::empty());
        let mut b = role(3, true, Permissions::empty());
        // Force a deterministic winner regardless of construction order.
        if a.id > b.id {
            std::mem::swap(&mut a, &mut b);
        }
        let tied = vec![a, b.clone()];
        assert_eq!(highest_hoisted_role(&tied).map(|r| r.id), Some(b.id));
    }

    #[test]
    fn expired_mutes_are_not_in_force() {
        let mut member = ServerMember {
            user_id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            role_ids: vec![],
            is_muted: true,
            muted_until: Some(Utc::now() - chrono::Duration::minutes(1)),
        };
        assert!(!member.muted_at(Utc::now()));
        member.muted_until = None;
        assert!(member.muted_at(Utc::now()));
    }

    #[test]
    fn permissions_serialize_as_plain_bits() {
        let perms = Permissions::SEND_MESSAGES | Permissions::KICK_MEMBERS;
        let json = serde_json::to_string(&perms).unwrap();
        assert_eq!(json, format!("{}", perms.bits()));
        let back: Permissions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, perms);
        // Unknown future bits are dropped, not rejected.
        let truncated: Permissions = serde_json::from_str("18446744073709551615").unwrap();
        assert_eq!(truncated, Permissions::all());
    }
}
