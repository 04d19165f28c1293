//! The single-threaded client event loop.
//!
//! Consumes the manager's scoped event stream and applies every mutation to
//! `ClientState` on one task. Nothing else writes this state, which is what
//! keeps N parallel connections race-free without locks around the app
//! model. Redraws are signaled through a watch counter.

use std::collections::HashMap;

use concord_protocol::events::{Event, GuildSnapshot, MemberProfile};
use concord_protocol::{
    ChannelId, Message, Role, Server, ServerId, Status, User, UserId,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::events::{ConnEvent, ConnState, EndpointId, ServerScopedMsg};
use crate::tree::ChannelTree;
use crate::unread::UnreadTracker;

/// Messages kept per channel in the view model.
const MESSAGE_VIEW_CAP: usize = 500;

#[derive(Debug, Default)]
pub struct EndpointState {
    pub conn_state: Option<ConnState>,
    pub session_id: Option<String>,
    pub user: Option<User>,
    pub servers: HashMap<ServerId, Server>,
    pub roles: HashMap<ServerId, Vec<Role>>,
    pub members: HashMap<ServerId, Vec<MemberProfile>>,
    pub trees: HashMap<ServerId, ChannelTree>,
    pub messages: HashMap<ChannelId, Vec<Message>>,
    pub presence: HashMap<UserId, Status>,
    pub typing: HashMap<ChannelId, Vec<UserId>>,
    pub whispers: Vec<(User, String)>,
    pub reactions: HashMap<concord_protocol::MessageId, Vec<(UserId, String)>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct ClientState {
    pub endpoints: HashMap<EndpointId, EndpointState>,
    pub unread: UnreadTracker,
    /// The channel on screen; messages landing here never count as unread.
    pub selected: Option<(EndpointId, ChannelId)>,
    /// The alias used for mention detection.
    pub alias: String,
}

impl ClientState {
    pub fn new(alias: &str, unread: UnreadTracker) -> Self {
        Self {
            endpoints: HashMap::new(),
            unread,
            selected: None,
            alias: alias.to_owned(),
        }
    }

    pub fn endpoint(&mut self, id: EndpointId) -> &mut EndpointState {
        self.endpoints.entry(id).or_default()
    }

    /// Select a channel for viewing; zeroes its unread counters.
    pub fn select_channel(&mut self, endpoint_id: EndpointId, channel_id: ChannelId) {
        self.selected = Some((endpoint_id, channel_id));
        self.unread.select(endpoint_id, channel_id);
    }

    /// Apply one scoped event. Returns true when a redraw is warranted.
    pub fn apply(&mut self, msg: ServerScopedMsg) -> bool {
        let endpoint_id = msg.endpoint_id;
        match msg.inner {
            ConnEvent::StateChanged(state) => {
                self.endpoint(endpoint_id).conn_state = Some(state);
                true
            }
            ConnEvent::Dispatch { seq: _, event } => self.apply_event(endpoint_id, event),
            ConnEvent::InvalidSession { reason } => {
                self.endpoint(endpoint_id).last_error = Some(reason);
                true
            }
            ConnEvent::Reconnect => {
                debug!(endpoint_id = %endpoint_id, "server requested reconnect");
                false
            }
            ConnEvent::ProtocolError(err) => {
                warn!(endpoint_id = %endpoint_id, code = ?err.code, message = %err.message, "server error");
                self.endpoint(endpoint_id).last_error = Some(err.message);
                true
            }
            ConnEvent::Closed => {
                let endpoint = self.endpoint(endpoint_id);
                endpoint.conn_state = Some(ConnState::Disconnected);
                endpoint.typing.clear();
                true
            }
        }
    }

    fn apply_event(&mut self, endpoint_id: EndpointId, event: Event) -> bool {
        match event {
            Event::Ready(ready) => {
                let endpoint = self.endpoint(endpoint_id);
                endpoint.session_id = Some(ready.session_id);
                endpoint.user = Some(ready.user);
                for snapshot in ready.servers {
                    apply_guild(endpoint, snapshot);
                }
                true
            }
            Event::ServerCreate(snapshot) => {
                apply_guild(self.endpoint(endpoint_id), snapshot);
                true
            }
            Event::MessageCreate(payload) => {
                let channel_id = payload.message.channel_id;
                let content = payload.message.content.clone();
                push_message(self.endpoint(endpoint_id), payload.message);
                let viewing = match self.selected {
                    Some((ep, ch)) if ep == endpoint_id => Some(ch),
                    _ => None,
                };
                let alias = self.alias.clone();
                self.unread
                    .on_message(endpoint_id, channel_id, &content, &alias, viewing);
                // The author is no longer typing.
                if let Some(typing) = self.endpoint(endpoint_id).typing.get_mut(&channel_id) {
                    typing.retain(|u| *u != payload.author.id);
                }
                true
            }
            Event::SystemMessage(payload) => {
                push_message(self.endpoint(endpoint_id), payload.message);
                true
            }
            Event::MessageDelete(payload) => {
                let endpoint = self.endpoint(endpoint_id);
                if let Some(messages) = endpoint.messages.get_mut(&payload.channel_id) {
                    messages.retain(|m| m.id != payload.message_id);
                }
                endpoint.reactions.remove(&payload.message_id);
                true
            }
            Event::MessagesHistory(payload) => {
                let endpoint = self.endpoint(endpoint_id);
                let entry = endpoint.messages.entry(payload.channel_id).or_default();
                for message in payload.messages.into_iter().rev() {
                    if !entry.iter().any(|m| m.id == message.id) {
                        entry.insert(0, message);
                    }
                }
                true
            }
            Event::PresenceUpdate(payload) => {
                let endpoint = self.endpoint(endpoint_id);
                endpoint.presence.insert(payload.user_id, payload.status);
                for members in endpoint.members.values_mut() {
                    if let Some(profile) = members
                        .iter_mut()
                        .find(|m| m.member.user_id == payload.user_id)
                    {
                        profile.user.status = payload.status;
                        profile.user.status_text.clone_from(&payload.status_text);
                    }
                }
                true
            }
            Event::TypingStart(payload) => {
                let typing = self
                    .endpoint(endpoint_id)
                    .typing
                    .entry(payload.channel_id)
                    .or_default();
                if !typing.contains(&payload.user_id) {
                    typing.push(payload.user_id);
                }
                true
            }
            Event::ChannelCreate(payload) => {
                let endpoint = self.endpoint(endpoint_id);
                let tree = endpoint
                    .trees
                    .entry(payload.channel.server_id)
                    .or_default();
                if let Err(e) = tree.add(payload.channel) {
                    debug!(error = %e, "channel create ignored");
                }
                true
            }
            Event::ChannelUpdate(payload) => {
                let endpoint = self.endpoint(endpoint_id);
                let tree = endpoint
                    .trees
                    .entry(payload.channel.server_id)
                    .or_default();
                let result = if tree.contains(payload.channel.id) {
                    tree.update(payload.channel)
                } else {
                    tree.add(payload.channel)
                };
                if let Err(e) = result {
                    debug!(error = %e, "channel update ignored");
                }
                true
            }
            Event::ChannelDelete(payload) => {
                let endpoint = self.endpoint(endpoint_id);
                if let Some(tree) = endpoint.trees.get_mut(&payload.server_id) {
                    if let Err(e) = tree.remove(payload.channel_id) {
                        debug!(error = %e, "channel delete ignored");
                    }
                }
                endpoint.messages.remove(&payload.channel_id);
                endpoint.typing.remove(&payload.channel_id);
                if self.selected == Some((endpoint_id, payload.channel_id)) {
                    self.selected = None;
                }
                true
            }
            Event::ServerMemberAdd(payload) => {
                let members = self
                    .endpoint(endpoint_id)
                    .members
                    .entry(payload.server_id)
                    .or_default();
                members.retain(|m| m.member.user_id != payload.profile.member.user_id);
                members.push(payload.profile);
                true
            }
            Event::ServerMemberRemove(payload) => {
                let endpoint = self.endpoint(endpoint_id);
                if let Some(members) = endpoint.members.get_mut(&payload.server_id) {
                    members.retain(|m| m.member.user_id != payload.user_id);
                }
                // If we were the one removed, the guild itself goes away.
                if endpoint.user.as_ref().map(|u| u.id) == Some(payload.user_id) {
                    endpoint.servers.remove(&payload.server_id);
                    endpoint.roles.remove(&payload.server_id);
                    endpoint.members.remove(&payload.server_id);
                    endpoint.trees.remove(&payload.server_id);
                }
                true
            }
            Event::ServerMemberUpdate(payload) => {
                let endpoint = self.endpoint(endpoint_id);
                if let Some(members) = endpoint.members.get_mut(&payload.server_id) {
                    if let Some(profile) = members
                        .iter_mut()
                        .find(|m| m.member.user_id == payload.member.user_id)
                    {
                        profile.member = payload.member;
                    }
                }
                true
            }
            Event::WhisperCreate(payload) => {
                self.endpoint(endpoint_id)
                    .whispers
                    .push((payload.from, payload.content));
                true
            }
            Event::MessageReactionAdd(payload) => {
                let reactions = self
                    .endpoint(endpoint_id)
                    .reactions
                    .entry(payload.message_id)
                    .or_default();
                if !reactions.contains(&(payload.user_id, payload.emoji.clone())) {
                    reactions.push((payload.user_id, payload.emoji));
                }
                true
            }
            Event::MessageReactionRemove(payload) => {
                if let Some(reactions) = self
                    .endpoint(endpoint_id)
                    .reactions
                    .get_mut(&payload.message_id)
                {
                    reactions.retain(|(u, e)| !(*u == payload.user_id && *e == payload.emoji));
                }
                true
            }
        }
    }
}

fn apply_guild(endpoint: &mut EndpointState, snapshot: GuildSnapshot) {
    let server_id = snapshot.server.id;
    endpoint.servers.insert(server_id, snapshot.server);
    endpoint.roles.insert(server_id, snapshot.roles);
    for profile in &snapshot.members {
        endpoint
            .presence
            .insert(profile.user.id, profile.user.status);
    }
    endpoint.members.insert(server_id, snapshot.members);

    let mut tree = ChannelTree::new();
    // Categories first so leaves can attach to them regardless of the
    // snapshot's ordering.
    let (categories, leaves): (Vec<_>, Vec<_>) = snapshot
        .channels
        .into_iter()
        .partition(|c| c.kind == concord_protocol::ChannelKind::Category);
    for channel in categories.into_iter().chain(leaves) {
        if let Err(e) = tree.add(channel) {
            debug!(error = %e, "duplicate channel in guild snapshot");
        }
    }
    endpoint.trees.insert(server_id, tree);
}

fn push_message(endpoint: &mut EndpointState, message: Message) {
    let entry = endpoint.messages.entry(message.channel_id).or_default();
    entry.push(message);
    if entry.len() > MESSAGE_VIEW_CAP {
        let excess = entry.len() - MESSAGE_VIEW_CAP;
        entry.drain(..excess);
    }
}

/// Run the loop until the scoped channel closes. Every applied event that
/// changes visible state bumps the redraw counter.
pub async fn run(
    mut rx: mpsc::Receiver<ServerScopedMsg>,
    mut state: ClientState,
    redraw_tx: watch::Sender<u64>,
) -> ClientState {
    while let Some(msg) = rx.recv().await {
        if state.apply(msg) {
            redraw_tx.send_modify(|n| *n += 1);
        }
    }
    state
}
