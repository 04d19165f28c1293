//! The closed set of dispatch events and their payloads.
//!
//! Every server-originated domain event travels as a Dispatch frame whose
//! `t` field names one of these events. The client applies all of them; the
//! reaction events are protocol surface the server does not currently emit.

use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameError};
use crate::model::{
    Channel, ChannelId, Message, MessageId, Role, Server, ServerId, ServerMember, Status, User,
    UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventName {
    Ready,
    ServerCreate,
    MessageCreate,
    MessageDelete,
    MessagesHistory,
    PresenceUpdate,
    TypingStart,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    ServerMemberAdd,
    ServerMemberRemove,
    ServerMemberUpdate,
    WhisperCreate,
    MessageReactionAdd,
    MessageReactionRemove,
    SystemMessage,
}

/// A member together with its user profile, as carried in guild snapshots
/// and member events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub member: ServerMember,
    pub user: User,
}

/// The full state of one guild: sent as `SERVER_CREATE` after READY, on
/// `RequestGuild`, and embedded in the READY payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSnapshot {
    pub server: Server,
    pub channels: Vec<Channel>,
    pub members: Vec<MemberProfile>,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    pub user: User,
    pub servers: Vec<GuildSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCreatePayload {
    pub message: Message,
    pub author: User,
    /// Echo of the sender-supplied de-dup token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeletePayload {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

/// Addressed to the single requesting user, never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesHistoryPayload {
    pub channel_id: ChannelId,
    /// Oldest first.
    pub messages: Vec<Message>,
    pub authors: Vec<User>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdatePayload {
    pub user_id: UserId,
    pub status: Status,
    #[serde(default)]
    pub status_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStartPayload {
    pub channel_id: ChannelId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub channel: Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDeletePayload {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMemberAddPayload {
    pub server_id: ServerId,
    #[serde(flatten)]
    pub profile: MemberProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMemberRemovePayload {
    pub server_id: ServerId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMemberUpdatePayload {
    pub server_id: ServerId,
    pub member: ServerMember,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhisperCreatePayload {
    pub from: User,
    pub to_user_id: UserId,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

/// Rendered by clients as a centered announcement; persisted with
/// `MessageKind::System`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessagePayload {
    pub message: Message,
}

/// A dispatch event with its typed payload, pairing each [`EventName`] with
/// the payload the other side expects.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ready(ReadyPayload),
    ServerCreate(GuildSnapshot),
    MessageCreate(MessageCreatePayload),
    MessageDelete(MessageDeletePayload),
    MessagesHistory(MessagesHistoryPayload),
    PresenceUpdate(PresenceUpdatePayload),
    TypingStart(TypingStartPayload),
    ChannelCreate(ChannelPayload),
    ChannelUpdate(ChannelPayload),
    ChannelDelete(ChannelDeletePayload),
    ServerMemberAdd(ServerMemberAddPayload),
    ServerMemberRemove(ServerMemberRemovePayload),
    ServerMemberUpdate(ServerMemberUpdatePayload),
    WhisperCreate(WhisperCreatePayload),
    MessageReactionAdd(ReactionPayload),
    MessageReactionRemove(ReactionPayload),
    SystemMessage(SystemMessagePayload),
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::Ready(_) => EventName::Ready,
            Event::ServerCreate(_) => EventName::ServerCreate,
            Event::MessageCreate(_) => EventName::MessageCreate,
            Event::MessageDelete(_) => EventName::MessageDelete,
            Event::MessagesHistory(_) => EventName::MessagesHistory,
            Event::PresenceUpdate(_) => EventName::PresenceUpdate,
            Event::TypingStart(_) => EventName::TypingStart,
            Event::ChannelCreate(_) => EventName::ChannelCreate,
            Event::ChannelUpdate(_) => EventName::ChannelUpdate,
            Event::ChannelDelete(_) => EventName::ChannelDelete,
            Event::ServerMemberAdd(_) => EventName::ServerMemberAdd,
            Event::ServerMemberRemove(_) => EventName::ServerMemberRemove,
            Event::ServerMemberUpdate(_) => EventName::ServerMemberUpdate,
            Event::WhisperCreate(_) => EventName::WhisperCreate,
            Event::MessageReactionAdd(_) => EventName::MessageReactionAdd,
            Event::MessageReactionRemove(_) => EventName::MessageReactionRemove,
            Event::SystemMessage(_) => EventName::SystemMessage,
        }
    }

    /// Build the Dispatch frame for this event with the hub-assigned
    /// sequence number.
    pub fn to_frame(&self, seq: u64) -> Result<Frame, FrameError> {
        match self {
            Event::Ready(p) => Frame::dispatch(self.name(), seq, p),
            Event::ServerCreate(p) => Frame::dispatch(self.name(), seq, p),
            Event::MessageCreate(p) => Frame::dispatch(self.name(), seq, p),
            Event::MessageDelete(p) => Frame::dispatch(self.name(), seq, p),
            Event::MessagesHistory(p) => Frame::dispatch(self.name(), seq, p),
            Event::PresenceUpdate(p) => Frame::dispatch(self.name(), seq, p),
            Event::TypingStart(p) => Frame::dispatch(self.name(), seq, p),
            Event::ChannelCreate(p) | Event::ChannelUpdate(p) => {
                Frame::dispatch(self.name(), seq, p)
            }
            Event::ChannelDelete(p) => Frame::dispatch(self.name(), seq, p),
            Event::ServerMemberAdd(p) => Frame::dispatch(self.name(), seq, p),
            Event::ServerMemberRemove(p) => Frame::dispatch(self.name(), seq, p),
            Event::ServerMemberUpdate(p) => Frame::dispatch(self.name(), seq, p),
            Event::WhisperCreate(p) => Frame::dispatch(self.name(), seq, p),
            Event::MessageReactionAdd(p) | Event::MessageReactionRemove(p) => {
                Frame::dispatch(self.name(), seq, p)
            }
            Event::SystemMessage(p) => Frame::dispatch(self.name(), seq, p),
        }
    }

    /// Decode a received Dispatch frame back into its typed event.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, FrameError> {
        let Some(name) = frame.t else {
            return Ok(None);
        };
        let event = match name {
            EventName::Ready => Event::Ready(frame.payload()?),
            EventName::ServerCreate => Event::ServerCreate(frame.payload()?),
            EventName::MessageCreate => Event::MessageCreate(frame.payload()?),
            EventName::MessageDelete => Event::MessageDelete(frame.payload()?),
            EventName::MessagesHistory => Event::MessagesHistory(frame.payload()?),
            EventName::PresenceUpdate => Event::PresenceUpdate(frame.payload()?),
            EventName::TypingStart => Event::TypingStart(frame.payload()?),
            EventName::ChannelCreate => Event::ChannelCreate(frame.payload()?),
            EventName::ChannelUpdate => Event::ChannelUpdate(frame.payload()?),
            EventName::ChannelDelete => Event::ChannelDelete(frame.payload()?),
            EventName::ServerMemberAdd => Event::ServerMemberAdd(frame.payload()?),
            EventName::ServerMemberRemove => Event::ServerMemberRemove(frame.payload()?),
            EventName::ServerMemberUpdate => Event::ServerMemberUpdate(frame.payload()?),
            EventName::WhisperCreate => Event::WhisperCreate(frame.payload()?),
            EventName::MessageReactionAdd => Event::MessageReactionAdd(frame.payload()?),
            EventName::MessageReactionRemove => Event::MessageReactionRemove(frame.payload()?),
            EventName::SystemMessage => Event::SystemMessage(frame.payload()?),
        };
        Ok(Some(event))
    }
}
