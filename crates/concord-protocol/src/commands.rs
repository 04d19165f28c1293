//! Typed `d` payloads for client→server frames and the handful of
//! server→client plumbing frames that carry data.

use serde::{Deserialize, Serialize};

use crate::model::{ChannelId, ChannelKind, MessageId, ServerId, Status, UserId};

/// `Hello` (op 10), sent by the server immediately on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub heartbeat_interval_ms: u64,
}

/// `Identify` (op 2). Must be the first client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    /// Free-form client metadata (client name, OS); logged, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
}

/// `InvalidSession` (op 14).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidSession {
    pub reason: String,
}

/// `Heartbeat` (op 1). The payload is optional on the wire (decode through
/// `Option<HeartbeatCommand>`); `seq` reports the last dispatch sequence the
/// client has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// `PresenceUpdate` (op 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdateCommand {
    pub status: Status,
    #[serde(default)]
    pub status_text: String,
}

/// `TypingStart` (op 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStartCommand {
    pub channel_id: ChannelId,
}

/// `SendMessage` (op 5). The `nonce` is echoed back in `MESSAGE_CREATE`
/// so the sender can de-duplicate its optimistic echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageCommand {
    pub channel_id: ChannelId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

/// `RequestGuild` (op 6). Re-sends the full `SERVER_CREATE` snapshot to the
/// requesting connection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGuildCommand {
    pub server_id: ServerId,
}

/// `RequestMessages` (op 7). Replies with a `MESSAGES_HISTORY` dispatch
/// addressed to the requesting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessagesCommand {
    pub channel_id: ChannelId,
    /// Page boundary: only messages created before this one are returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// `ChannelCreate` (op 20). Requires `MANAGE_CHANNELS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCreateCommand {
    pub server_id: ServerId,
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// `ChannelUpdate` (op 21). Absent fields are left unchanged; a present
/// `category_id` of `null` detaches the channel to top level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUpdateCommand {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
    /// Double-optional: outer None = untouched, inner None = move to root.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_double_option"
    )]
    pub category_id: Option<Option<ChannelId>>,
}

/// `ChannelDelete` (op 22).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDeleteCommand {
    pub channel_id: ChannelId,
}

/// `RoleAssign` / `RoleRemove` (ops 23/24). Roles are addressed by name
/// within the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChangeCommand {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub role_name: String,
}

/// `KickMember` / `BanMember` (ops 25/26).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMemberCommand {
    pub server_id: ServerId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `MuteMember` (op 27). Toggles the member's mute flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteMemberCommand {
    pub server_id: ServerId,
    pub user_id: UserId,
}

/// `Whisper` (op 28). Delivered to the target user only, echoed to the
/// sender; target must be online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhisperCommand {
    pub to_user_id: UserId,
    pub content: String,
}

/// serde adapter distinguishing an absent field from an explicit `null`.
mod serde_double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            // Skipped by skip_serializing_if; serialize as null defensively.
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
