//! concord-protocol: wire protocol types for the Concord chat platform.
//!
//! The crate holds everything both sides of a connection must agree on: the
//! `{op, d, t, s}` frame shape, the opcode and error-code registers, the
//! closed dispatch event set with typed payloads, and the shared domain
//! model. Transport, persistence, and policy live in the services.

pub mod commands;
pub mod events;
pub mod frame;
pub mod model;

pub use commands::{
    ChannelCreateCommand, ChannelDeleteCommand, ChannelUpdateCommand, HeartbeatCommand, Hello,
    Identify, InvalidSession, MuteMemberCommand, PresenceUpdateCommand, RemoveMemberCommand,
    RequestGuildCommand, RequestMessagesCommand, RoleChangeCommand, SendMessageCommand,
    TypingStartCommand, WhisperCommand,
};
pub use events::{Event, EventName, GuildSnapshot, MemberProfile, ReadyPayload};
pub use frame::{ErrorCode, ErrorPayload, Frame, FrameError, MAX_FRAME_BYTES, OpCode};
pub use model::{
    Channel, ChannelId, ChannelKind, MAX_CHANNEL_NAME_BYTES, MAX_MESSAGE_BYTES, Message, MessageId,
    MessageKind, Permissions, Role, RoleId, Server, ServerId, ServerMember, Status, User, UserId,
    effective_permissions, highest_hoisted_role,
};

/// The heartbeat interval the server advertises in `Hello`.
pub const HEARTBEAT_INTERVAL_MS: u64 = 45_000;
