//! Authenticated request handlers.
//!
//! Each mutating opcode decodes its typed payload, checks permissions and
//! sanity against the store, mutates inside a transaction, and emits exactly
//! one domain event through the hub. Failures map onto the closed error
//! taxonomy and are returned to the originating connection only.

use chrono::Utc;
use concord_protocol::events::{
    ChannelDeletePayload, ChannelPayload, Event, GuildSnapshot, MessageCreatePayload,
    MessagesHistoryPayload, PresenceUpdatePayload, ServerMemberRemovePayload,
    ServerMemberUpdatePayload, SystemMessagePayload, TypingStartPayload, WhisperCreatePayload,
};
use concord_protocol::{
    effective_permissions, Channel, ChannelCreateCommand, ChannelDeleteCommand, ChannelKind,
    ChannelUpdateCommand, ErrorCode, Frame, FrameError, Message, MessageKind,
    MuteMemberCommand, MAX_CHANNEL_NAME_BYTES, MAX_MESSAGE_BYTES, OpCode, Permissions,
    PresenceUpdateCommand, RemoveMemberCommand, RequestGuildCommand, RequestMessagesCommand,
    RoleChangeCommand, SendMessageCommand, Server, ServerId, Status, TypingStartCommand, User,
    UserId, WhisperCommand,
};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::hub::{BroadcastMessage, ConnId, Outbound, Target};
use crate::state::AppState;
use crate::store::StoreError;

/// Upper bound on one `RequestMessages` page.
pub const MAX_HISTORY_MESSAGES: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("not authenticated")]
    Unauthorized,
    #[error("already authenticated")]
    AlreadyAuthenticated,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("internal error")]
    Server(#[source] StoreError),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            ApiError::Unauthorized => ErrorCode::Unauthorized,
            ApiError::AlreadyAuthenticated => ErrorCode::AlreadyAuthenticated,
            ApiError::Forbidden(_) => ErrorCode::Forbidden,
            ApiError::NotFound(_) => ErrorCode::NotFound,
            ApiError::Server(_) => ErrorCode::ServerError,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("not found"),
            other => ApiError::Server(other),
        }
    }
}

impl From<FrameError> for ApiError {
    fn from(e: FrameError) -> Self {
        ApiError::InvalidPayload(e.to_string())
    }
}

/// Everything a handler needs to know about the connection it serves.
pub struct SessionCtx {
    pub state: AppState,
    pub conn_id: ConnId,
    pub session_id: String,
    pub user_id: UserId,
    /// Direct reply queue (acks, errors); dispatches go through the hub.
    pub out: mpsc::Sender<Outbound>,
}

impl SessionCtx {
    /// Non-blocking direct reply; a full queue drops the frame, same as the
    /// hub's fan-out contract.
    pub fn offer(&self, frame: &Frame) {
        match frame.encode() {
            Ok(text) => {
                if self.out.try_send(Outbound::Frame(text.into())).is_err() {
                    warn!(conn_id = %self.conn_id, "reply queue full or closed, dropping frame");
                }
            }
            Err(e) => error!(error = %e, "failed to encode reply frame"),
        }
    }

    pub fn offer_error(&self, err: &ApiError) {
        self.offer(&Frame::error(err.code(), err.to_string()));
    }
}

/// Route an authenticated frame. `Err` means an error frame must go back to
/// the client; the connection itself stays healthy either way.
pub async fn handle_frame(ctx: &SessionCtx, frame: Frame) -> Result<(), ApiError> {
    match frame.op {
        OpCode::Heartbeat => handle_heartbeat(ctx, &frame).await,
        OpCode::Identify => Err(ApiError::AlreadyAuthenticated),
        OpCode::PresenceUpdate => handle_presence_update(ctx, frame.payload()?).await,
        OpCode::TypingStart => handle_typing_start(ctx, frame.payload()?).await,
        OpCode::SendMessage => handle_send_message(ctx, frame.payload()?).await,
        OpCode::RequestGuild => handle_request_guild(ctx, frame.payload()?).await,
        OpCode::RequestMessages => handle_request_messages(ctx, frame.payload()?).await,
        OpCode::ChannelCreate => handle_channel_create(ctx, frame.payload()?).await,
        OpCode::ChannelUpdate => handle_channel_update(ctx, frame.payload()?).await,
        OpCode::ChannelDelete => handle_channel_delete(ctx, frame.payload()?).await,
        OpCode::RoleAssign => handle_role_change(ctx, frame.payload()?, true).await,
        OpCode::RoleRemove => handle_role_change(ctx, frame.payload()?, false).await,
        OpCode::KickMember => handle_remove_member(ctx, frame.payload()?, false).await,
        OpCode::BanMember => handle_remove_member(ctx, frame.payload()?, true).await,
        OpCode::MuteMember => handle_mute_member(ctx, frame.payload()?).await,
        OpCode::Whisper => handle_whisper(ctx, frame.payload()?).await,
        // Server-originated opcodes arriving from a client.
        _ => Err(ApiError::InvalidPayload(format!(
            "opcode {:?} is not a client command",
            frame.op
        ))),
    }
}

async fn handle_heartbeat(ctx: &SessionCtx, frame: &Frame) -> Result<(), ApiError> {
    let hb = frame
        .payload::<Option<concord_protocol::HeartbeatCommand>>()?
        .unwrap_or_default();
    if let Some(seq) = hb.seq {
        let store = ctx.state.store.lock().await;
        store
            .update_session_seq(&ctx.session_id, seq)
            .map_err(ApiError::from)?;
    }
    ctx.offer(&Frame::bare(OpCode::HeartbeatAck));
    Ok(())
}

async fn handle_presence_update(
    ctx: &SessionCtx,
    cmd: PresenceUpdateCommand,
) -> Result<(), ApiError> {
    let servers = {
        let store = ctx.state.store.lock().await;
        store.set_user_status(ctx.user_id, cmd.status, Some(&cmd.status_text))?;
        store.servers_for_user(ctx.user_id)?
    };
    broadcast_presence(ctx, &servers, cmd.status, &cmd.status_text, None).await;
    Ok(())
}

/// Fan a presence change out to every server the user is in. Pass
/// `exclude_user` to suppress the user's own echo, e.g. for the implicit
/// online transition whose state the client already has from READY.
pub async fn broadcast_presence(
    ctx: &SessionCtx,
    servers: &[Server],
    status: Status,
    status_text: &str,
    exclude_user: Option<UserId>,
) {
    for server in servers {
        ctx.state
            .hub
            .broadcast(BroadcastMessage {
                target: Target::Server(server.id),
                exclude_user,
                event: Event::PresenceUpdate(PresenceUpdatePayload {
                    user_id: ctx.user_id,
                    status,
                    status_text: status_text.to_owned(),
                }),
            })
            .await;
    }
}

async fn handle_typing_start(ctx: &SessionCtx, cmd: TypingStartCommand) -> Result<(), ApiError> {
    let channel = {
        let store = ctx.state.store.lock().await;
        let channel = store
            .channel_by_id(cmd.channel_id)?
            .ok_or(ApiError::NotFound("unknown channel"))?;
        if store.member(channel.server_id, ctx.user_id)?.is_none() {
            return Err(ApiError::Forbidden("not a member of this server"));
        }
        channel
    };
    ctx.state.typing.note(channel.id, ctx.user_id).await;
    ctx.state
        .hub
        .broadcast(BroadcastMessage {
            target: Target::Channel(channel.id),
            exclude_user: Some(ctx.user_id),
            event: Event::TypingStart(TypingStartPayload {
                channel_id: channel.id,
                user_id: ctx.user_id,
            }),
        })
        .await;
    Ok(())
}

async fn handle_send_message(ctx: &SessionCtx, cmd: SendMessageCommand) -> Result<(), ApiError> {
    if cmd.content.is_empty() || cmd.content.len() > MAX_MESSAGE_BYTES {
        return Err(ApiError::InvalidPayload(format!(
            "content must be 1..={MAX_MESSAGE_BYTES} bytes"
        )));
    }

    let (message, author) = {
        let store = ctx.state.store.lock().await;
        let channel = store
            .channel_by_id(cmd.channel_id)?
            .ok_or(ApiError::NotFound("unknown channel"))?;
        let member = store
            .member(channel.server_id, ctx.user_id)?
            .ok_or(ApiError::Forbidden("not a member of this server"))?;
        if member.muted_at(Utc::now()) {
            return Err(ApiError::Forbidden("you are muted on this server"));
        }
        let author = store
            .user_by_id(ctx.user_id)?
            .ok_or(ApiError::NotFound("unknown user"))?;
        let message = Message {
            id: Uuid::new_v4(),
            channel_id: channel.id,
            author_id: ctx.user_id,
            content: cmd.content,
            created_at: Utc::now(),
            reply_to_id: cmd.reply_to_id,
            kind: MessageKind::Default,
        };
        store.insert_message(&message)?;
        (message, author)
    };

    ctx.state.typing.clear(message.channel_id, ctx.user_id).await;
    ctx.state
        .hub
        .dispatch(
            Target::Channel(message.channel_id),
            Event::MessageCreate(MessageCreatePayload {
                message,
                author,
                nonce: cmd.nonce,
            }),
        )
        .await;
    Ok(())
}

async fn handle_request_guild(ctx: &SessionCtx, cmd: RequestGuildCommand) -> Result<(), ApiError> {
    let snapshot = {
        let store = ctx.state.store.lock().await;
        if store.member(cmd.server_id, ctx.user_id)?.is_none() {
            return Err(ApiError::NotFound("unknown server"));
        }
        store.guild_snapshot(cmd.server_id)?
    };
    ctx.state
        .hub
        .dispatch(Target::User(ctx.user_id), Event::ServerCreate(snapshot))
        .await;
    Ok(())
}

async fn handle_request_messages(
    ctx: &SessionCtx,
    cmd: RequestMessagesCommand,
) -> Result<(), ApiError> {
    let limit = cmd
        .limit
        .map_or(MAX_HISTORY_MESSAGES, |l| l as usize)
        .min(MAX_HISTORY_MESSAGES);
    let payload = {
        let store = ctx.state.store.lock().await;
        let channel = store
            .channel_by_id(cmd.channel_id)?
            .ok_or(ApiError::NotFound("unknown channel"))?;
        if store.member(channel.server_id, ctx.user_id)?.is_none() {
            return Err(ApiError::Forbidden("not a member of this server"));
        }
        let (messages, authors, has_more) =
            store.recent_messages(cmd.channel_id, limit, cmd.before)?;
        MessagesHistoryPayload {
            channel_id: cmd.channel_id,
            messages,
            authors,
            has_more,
        }
    };
    // Addressed to the requesting user only, never broadcast.
    ctx.state
        .hub
        .dispatch(Target::User(ctx.user_id), Event::MessagesHistory(payload))
        .await;
    Ok(())
}

/// Owner → allow; admin → allow; otherwise the OR of the member's role bits
/// must contain `needed`.
async fn require_permission(
    ctx: &SessionCtx,
    server_id: ServerId,
    needed: Permissions,
) -> Result<Server, ApiError> {
    let store = ctx.state.store.lock().await;
    let server = store
        .server_by_id(server_id)?
        .ok_or(ApiError::NotFound("unknown server"))?;
    if server.owner_id == ctx.user_id || store.is_admin(ctx.user_id)? {
        return Ok(server);
    }
    if store.member(server_id, ctx.user_id)?.is_none() {
        return Err(ApiError::Forbidden("not a member of this server"));
    }
    let roles = store.member_roles(server_id, ctx.user_id)?;
    if effective_permissions(false, &roles).contains(needed) {
        Ok(server)
    } else {
        Err(ApiError::Forbidden("missing permission"))
    }
}

fn validate_channel_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_BYTES {
        return Err(ApiError::InvalidPayload(format!(
            "channel name must be 1..={MAX_CHANNEL_NAME_BYTES} bytes"
        )));
    }
    Ok(())
}

async fn handle_channel_create(
    ctx: &SessionCtx,
    cmd: ChannelCreateCommand,
) -> Result<(), ApiError> {
    require_permission(ctx, cmd.server_id, Permissions::MANAGE_CHANNELS).await?;
    validate_channel_name(&cmd.name)?;

    let channel = {
        let store = ctx.state.store.lock().await;
        if let Some(category_id) = cmd.category_id {
            let category = store
                .channel_by_id(category_id)?
                .ok_or(ApiError::NotFound("unknown category"))?;
            if category.kind != ChannelKind::Category || category.server_id != cmd.server_id {
                return Err(ApiError::InvalidPayload(
                    "category must be a category channel on the same server".to_owned(),
                ));
            }
        }
        let position = store
            .channels_for_server(cmd.server_id)?
            .iter()
            .map(|c| c.position)
            .max()
            .unwrap_or(-1)
            + 1;
        let channel = Channel {
            id: Uuid::new_v4(),
            server_id: cmd.server_id,
            name: cmd.name,
            kind: cmd.kind,
            category_id: if cmd.kind == ChannelKind::Category {
                None
            } else {
                cmd.category_id
            },
            position,
            topic: cmd.topic,
        };
        store.create_channel(&channel)?;
        channel
    };

    // Subscribe online members before the event goes out, so nobody can see
    // the channel and miss its first messages.
    ctx.state
        .hub
        .subscribe_channel(channel.server_id, channel.id)
        .await;
    ctx.state
        .hub
        .dispatch(
            Target::Server(channel.server_id),
            Event::ChannelCreate(ChannelPayload { channel }),
        )
        .await;
    Ok(())
}

async fn handle_channel_update(
    ctx: &SessionCtx,
    cmd: ChannelUpdateCommand,
) -> Result<(), ApiError> {
    let updated = {
        let store = ctx.state.store.lock().await;
        let mut channel = store
            .channel_by_id(cmd.channel_id)?
            .ok_or(ApiError::NotFound("unknown channel"))?;
        drop(store);
        require_permission(ctx, channel.server_id, Permissions::MANAGE_CHANNELS).await?;

        if let Some(name) = cmd.name {
            validate_channel_name(&name)?;
            channel.name = name;
        }
        if let Some(topic) = cmd.topic {
            channel.topic = Some(topic);
        }
        if let Some(position) = cmd.position {
            channel.position = position;
        }
        let store = ctx.state.store.lock().await;
        if let Some(new_category) = cmd.category_id {
            if channel.kind == ChannelKind::Category && new_category.is_some() {
                return Err(ApiError::InvalidPayload(
                    "a category cannot itself be categorized".to_owned(),
                ));
            }
            if let Some(category_id) = new_category {
                let category = store
                    .channel_by_id(category_id)?
                    .ok_or(ApiError::NotFound("unknown category"))?;
                if category.kind != ChannelKind::Category
                    || category.server_id != channel.server_id
                {
                    return Err(ApiError::InvalidPayload(
                        "category must be a category channel on the same server".to_owned(),
                    ));
                }
            }
            channel.category_id = new_category;
        }
        store.update_channel(&channel)?;
        channel
    };

    ctx.state
        .hub
        .dispatch(
            Target::Server(updated.server_id),
            Event::ChannelUpdate(ChannelPayload { channel: updated }),
        )
        .await;
    Ok(())
}

async fn handle_channel_delete(
    ctx: &SessionCtx,
    cmd: ChannelDeleteCommand,
) -> Result<(), ApiError> {
    let channel = {
        let store = ctx.state.store.lock().await;
        store
            .channel_by_id(cmd.channel_id)?
            .ok_or(ApiError::NotFound("unknown channel"))?
    };
    require_permission(ctx, channel.server_id, Permissions::MANAGE_CHANNELS).await?;
    {
        let mut store = ctx.state.store.lock().await;
        store.delete_channel(channel.id)?;
    }
    // Cascade the hub's channel index before announcing the deletion.
    ctx.state.hub.remove_channel(channel.id).await;
    ctx.state
        .hub
        .dispatch(
            Target::Server(channel.server_id),
            Event::ChannelDelete(ChannelDeletePayload {
                server_id: channel.server_id,
                channel_id: channel.id,
            }),
        )
        .await;
    Ok(())
}

async fn handle_role_change(
    ctx: &SessionCtx,
    cmd: RoleChangeCommand,
    assign: bool,
) -> Result<(), ApiError> {
    require_permission(ctx, cmd.server_id, Permissions::MANAGE_ROLES).await?;
    let member = {
        let store = ctx.state.store.lock().await;
        let role = store
            .role_by_name(cmd.server_id, &cmd.role_name)?
            .ok_or(ApiError::NotFound("unknown role"))?;
        if store.member(cmd.server_id, cmd.user_id)?.is_none() {
            return Err(ApiError::NotFound("unknown member"));
        }
        if assign {
            store.assign_role(cmd.server_id, cmd.user_id, role.id)?;
        } else {
            store.remove_role(cmd.server_id, cmd.user_id, role.id)?;
        }
        store
            .member(cmd.server_id, cmd.user_id)?
            .ok_or(ApiError::NotFound("unknown member"))?
    };
    ctx.state
        .hub
        .dispatch(
            Target::Server(cmd.server_id),
            Event::ServerMemberUpdate(ServerMemberUpdatePayload {
                server_id: cmd.server_id,
                member,
            }),
        )
        .await;
    Ok(())
}

async fn handle_remove_member(
    ctx: &SessionCtx,
    cmd: RemoveMemberCommand,
    ban: bool,
) -> Result<(), ApiError> {
    let needed = if ban {
        Permissions::BAN_MEMBERS
    } else {
        Permissions::KICK_MEMBERS
    };
    let server = require_permission(ctx, cmd.server_id, needed).await?;
    if cmd.user_id == server.owner_id {
        return Err(ApiError::Forbidden("the owner cannot be removed"));
    }

    let (target, announce_channel) = {
        let mut store = ctx.state.store.lock().await;
        let target = store
            .user_by_id(cmd.user_id)?
            .ok_or(ApiError::NotFound("unknown member"))?;
        if store.member(cmd.server_id, cmd.user_id)?.is_none() {
            return Err(ApiError::NotFound("unknown member"));
        }
        let reason = if ban {
            Some(cmd.reason.as_deref().unwrap_or(""))
        } else {
            None
        };
        store.remove_member(cmd.server_id, cmd.user_id, reason)?;
        (target, store.default_channel(cmd.server_id)?)
    };

    ctx.state
        .hub
        .dispatch(
            Target::Server(cmd.server_id),
            Event::ServerMemberRemove(ServerMemberRemovePayload {
                server_id: cmd.server_id,
                user_id: cmd.user_id,
                reason: cmd.reason,
            }),
        )
        .await;
    if let Some(channel) = announce_channel {
        let verb = if ban { "banned from" } else { "kicked from" };
        announce_system_message(
            ctx,
            channel.id,
            format!("{} was {} the server", target.username, verb),
        )
        .await;
    }
    // The removed member no longer belongs in this server's fan-out; their
    // connection is closed outright, as the original does.
    ctx.state.hub.close_user(cmd.user_id).await;
    Ok(())
}

/// Persist and dispatch a `SYSTEM_MESSAGE` into a channel.
pub async fn announce_system_message(ctx: &SessionCtx, channel_id: concord_protocol::ChannelId, content: String) {
    let message = Message {
        id: Uuid::new_v4(),
        channel_id,
        author_id: ctx.user_id,
        content,
        created_at: Utc::now(),
        reply_to_id: None,
        kind: MessageKind::System,
    };
    {
        let store = ctx.state.store.lock().await;
        if let Err(e) = store.insert_message(&message) {
            error!(error = %e, "failed to persist system message");
            return;
        }
    }
    ctx.state
        .hub
        .dispatch(
            Target::Channel(channel_id),
            Event::SystemMessage(SystemMessagePayload { message }),
        )
        .await;
}

async fn handle_mute_member(ctx: &SessionCtx, cmd: MuteMemberCommand) -> Result<(), ApiError> {
    require_permission(ctx, cmd.server_id, Permissions::MUTE_MEMBERS).await?;
    let member = {
        let store = ctx.state.store.lock().await;
        let member = store
            .member(cmd.server_id, cmd.user_id)?
            .ok_or(ApiError::NotFound("unknown member"))?;
        store.set_member_muted(cmd.server_id, cmd.user_id, !member.is_muted)?;
        store
            .member(cmd.server_id, cmd.user_id)?
            .ok_or(ApiError::NotFound("unknown member"))?
    };
    ctx.state
        .hub
        .dispatch(
            Target::Server(cmd.server_id),
            Event::ServerMemberUpdate(ServerMemberUpdatePayload {
                server_id: cmd.server_id,
                member,
            }),
        )
        .await;
    Ok(())
}

async fn handle_whisper(ctx: &SessionCtx, cmd: WhisperCommand) -> Result<(), ApiError> {
    if cmd.content.is_empty() || cmd.content.len() > MAX_MESSAGE_BYTES {
        return Err(ApiError::InvalidPayload(format!(
            "content must be 1..={MAX_MESSAGE_BYTES} bytes"
        )));
    }
    if !ctx.state.hub.is_user_online(cmd.to_user_id).await {
        return Err(ApiError::NotFound("user is not online"));
    }
    let from = {
        let store = ctx.state.store.lock().await;
        store
            .user_by_id(ctx.user_id)?
            .ok_or(ApiError::NotFound("unknown user"))?
    };
    let payload = WhisperCreatePayload {
        from,
        to_user_id: cmd.to_user_id,
        content: cmd.content,
        created_at: Utc::now(),
    };
    // Target sees it, and the sender gets an echo on all their connections.
    ctx.state
        .hub
        .dispatch(
            Target::User(cmd.to_user_id),
            Event::WhisperCreate(payload.clone()),
        )
        .await;
    if cmd.to_user_id != ctx.user_id {
        ctx.state
            .hub
            .dispatch(Target::User(ctx.user_id), Event::WhisperCreate(payload))
            .await;
    }
    Ok(())
}

/// Assemble and emit the READY sequence for a freshly authenticated
/// connection: READY first, then one SERVER_CREATE per guild.
pub async fn emit_ready(
    ctx: &SessionCtx,
    user: User,
    snapshots: Vec<GuildSnapshot>,
) {
    ctx.state
        .hub
        .dispatch(
            Target::User(ctx.user_id),
            Event::Ready(concord_protocol::ReadyPayload {
                session_id: ctx.session_id.clone(),
                user,
                servers: snapshots.clone(),
            }),
        )
        .await;
    for snapshot in snapshots {
        ctx.state
            .hub
            .dispatch(Target::User(ctx.user_id), Event::ServerCreate(snapshot))
            .await;
    }
}
