//! The dispatch hub: the single owner of the live-connection set.
//!
//! One task drains a command inbox and performs every index mutation and
//! every fan-out, so registration, deregistration, and broadcast are
//! serialized without locks on the hot path. Snapshot queries (online user
//! lists) go through a read lock that the dispatch task only takes for
//! writing.
//!
//! Delivery is at-most-once: enqueueing onto a connection's send queue is a
//! non-blocking offer, and a full queue drops the frame for that connection
//! only. Historical replay is `RequestMessages`' job, not the hub's.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use concord_protocol::{ChannelId, Event, Frame, OpCode, ServerId, UserId};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnId = Uuid;

/// Capacity of each connection's outbound queue.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// What travels down a connection's send queue to its write task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A pre-encoded frame, shared across all recipients of a fan-out.
    Frame(Arc<str>),
    /// Transport-level pong, requested by the read task.
    Pong(Vec<u8>),
    /// Graceful close: emit a normal-closure frame and stop.
    Close,
}

/// A registered connection as the hub sees it.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: ConnId,
    pub user_id: UserId,
    tx: mpsc::Sender<Outbound>,
}

impl ClientHandle {
    pub fn new(conn_id: ConnId, user_id: UserId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { conn_id, user_id, tx }
    }

    /// Non-blocking offer. A full or closed queue drops the frame for this
    /// connection only; the hub never waits on a slow client.
    fn offer(&self, item: Outbound) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.conn_id, user_id = %self.user_id, "send queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id = %self.conn_id, "send queue closed, dropping frame");
            }
        }
    }
}

/// Exactly one of the three scopes addresses a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    User(UserId),
    Server(ServerId),
    Channel(ChannelId),
}

#[derive(Debug)]
pub struct BroadcastMessage {
    pub target: Target,
    /// Suppress the originator's own echo where an event calls for it.
    pub exclude_user: Option<UserId>,
    pub event: Event,
}

enum HubCommand {
    Register {
        handle: ClientHandle,
        server_ids: Vec<ServerId>,
        channel_ids: Vec<ChannelId>,
    },
    Unregister {
        conn_id: ConnId,
    },
    Broadcast(Box<BroadcastMessage>),
    /// Subscribe every online member of `server_id` to a new channel.
    SubscribeChannel {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    RemoveChannel {
        channel_id: ChannelId,
    },
    /// Force-close every connection of a user (kick/ban).
    CloseUser {
        user_id: UserId,
    },
    /// Barrier: resolves once every previously enqueued command has been
    /// applied. Used by callers that must observe their own writes.
    Flush {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct Indices {
    conns: HashMap<ConnId, ClientHandle>,
    by_user: HashMap<UserId, HashSet<ConnId>>,
    by_server: HashMap<ServerId, HashSet<ConnId>>,
    by_channel: HashMap<ChannelId, HashSet<ConnId>>,
}

impl Indices {
    fn insert(&mut self, handle: ClientHandle, server_ids: &[ServerId], channel_ids: &[ChannelId]) {
        let conn_id = handle.conn_id;
        self.by_user.entry(handle.user_id).or_default().insert(conn_id);
        for server_id in server_ids {
            self.by_server.entry(*server_id).or_default().insert(conn_id);
        }
        for channel_id in channel_ids {
            self.by_channel.entry(*channel_id).or_default().insert(conn_id);
        }
        self.conns.insert(conn_id, handle);
    }

    fn remove(&mut self, conn_id: ConnId) -> Option<ClientHandle> {
        let handle = self.conns.remove(&conn_id)?;
        if let Some(set) = self.by_user.get_mut(&handle.user_id) {
            set.remove(&conn_id);
            if set.is_empty() {
                self.by_user.remove(&handle.user_id);
            }
        }
        self.by_server.retain(|_, set| {
            set.remove(&conn_id);
            !set.is_empty()
        });
        self.by_channel.retain(|_, set| {
            set.remove(&conn_id);
            !set.is_empty()
        });
        Some(handle)
    }

    fn recipients(&self, target: Target) -> Option<&HashSet<ConnId>> {
        match target {
            Target::User(id) => self.by_user.get(&id),
            Target::Server(id) => self.by_server.get(&id),
            Target::Channel(id) => self.by_channel.get(&id),
        }
    }
}

/// Cloneable handle onto the hub task.
#[derive(Clone)]
pub struct Hub {
    cmd_tx: mpsc::Sender<HubCommand>,
    indices: Arc<RwLock<Indices>>,
}

impl Hub {
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let indices = Arc::new(RwLock::new(Indices::default()));
        tokio::spawn(run(cmd_rx, Arc::clone(&indices)));
        Self { cmd_tx, indices }
    }

    async fn send(&self, cmd: HubCommand) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("hub task is gone, dropping command");
        }
    }

    pub async fn register(
        &self,
        handle: ClientHandle,
        server_ids: Vec<ServerId>,
        channel_ids: Vec<ChannelId>,
    ) {
        self.send(HubCommand::Register { handle, server_ids, channel_ids })
            .await;
    }

    pub async fn unregister(&self, conn_id: ConnId) {
        self.send(HubCommand::Unregister { conn_id }).await;
    }

    pub async fn broadcast(&self, msg: BroadcastMessage) {
        self.send(HubCommand::Broadcast(Box::new(msg))).await;
    }

    /// Convenience for the common no-exclusion case.
    pub async fn dispatch(&self, target: Target, event: Event) {
        self.broadcast(BroadcastMessage { target, exclude_user: None, event })
            .await;
    }

    pub async fn subscribe_channel(&self, server_id: ServerId, channel_id: ChannelId) {
        self.send(HubCommand::SubscribeChannel { server_id, channel_id })
            .await;
    }

    pub async fn remove_channel(&self, channel_id: ChannelId) {
        self.send(HubCommand::RemoveChannel { channel_id }).await;
    }

    pub async fn close_user(&self, user_id: UserId) {
        self.send(HubCommand::CloseUser { user_id }).await;
    }

    /// Wait until the dispatch task has applied everything enqueued so far.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(HubCommand::Flush { done }).await;
        let _ = wait.await;
    }

    /// Tell every connection to reconnect, close all queues, and stop the
    /// dispatch task. Resolves once the task has drained.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        self.send(HubCommand::Shutdown { done }).await;
        let _ = wait.await;
    }

    // -- snapshot queries ----------------------------------------------------

    pub async fn is_user_online(&self, user_id: UserId) -> bool {
        self.indices.read().await.by_user.contains_key(&user_id)
    }

    pub async fn online_users(&self, server_id: ServerId) -> Vec<UserId> {
        let indices = self.indices.read().await;
        let Some(conns) = indices.by_server.get(&server_id) else {
            return Vec::new();
        };
        let mut users: Vec<UserId> = conns
            .iter()
            .filter_map(|c| indices.conns.get(c).map(|h| h.user_id))
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    pub async fn connection_count(&self) -> usize {
        self.indices.read().await.conns.len()
    }

    /// Test-and-diagnostic visibility of the index invariant: every index a
    /// connection appears in, by id.
    pub async fn membership(&self, conn_id: ConnId) -> (bool, Vec<ServerId>, Vec<ChannelId>) {
        let indices = self.indices.read().await;
        let known = indices.conns.contains_key(&conn_id);
        let servers = indices
            .by_server
            .iter()
            .filter(|(_, set)| set.contains(&conn_id))
            .map(|(id, _)| *id)
            .collect();
        let channels = indices
            .by_channel
            .iter()
            .filter(|(_, set)| set.contains(&conn_id))
            .map(|(id, _)| *id)
            .collect();
        (known, servers, channels)
    }
}

async fn run(mut cmd_rx: mpsc::Receiver<HubCommand>, indices: Arc<RwLock<Indices>>) {
    // The global dispatch sequence. Lives on this task; every emitted
    // Dispatch stamps the next value.
    let mut seq: u64 = 0;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            HubCommand::Register { handle, server_ids, channel_ids } => {
                debug!(conn_id = %handle.conn_id, user_id = %handle.user_id, "register connection");
                indices.write().await.insert(handle, &server_ids, &channel_ids);
            }
            HubCommand::Unregister { conn_id } => {
                debug!(conn_id = %conn_id, "unregister connection");
                indices.write().await.remove(conn_id);
            }
            HubCommand::Broadcast(msg) => {
                seq += 1;
                let frame = match msg.event.to_frame(seq) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "failed to build dispatch frame");
                        continue;
                    }
                };
                let text: Arc<str> = match frame.encode() {
                    Ok(text) => text.into(),
                    Err(e) => {
                        warn!(error = %e, "failed to encode dispatch frame");
                        continue;
                    }
                };
                let guard = indices.read().await;
                if let Some(recipients) = guard.recipients(msg.target) {
                    for conn_id in recipients {
                        let Some(handle) = guard.conns.get(conn_id) else {
                            continue;
                        };
                        if msg.exclude_user == Some(handle.user_id) {
                            continue;
                        }
                        handle.offer(Outbound::Frame(Arc::clone(&text)));
                    }
                }
            }
            HubCommand::SubscribeChannel { server_id, channel_id } => {
                let mut guard = indices.write().await;
                let members: Vec<ConnId> = guard
                    .by_server
                    .get(&server_id)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                if !members.is_empty() {
                    let entry = guard.by_channel.entry(channel_id).or_default();
                    entry.extend(members);
                }
            }
            HubCommand::RemoveChannel { channel_id } => {
                indices.write().await.by_channel.remove(&channel_id);
            }
            HubCommand::CloseUser { user_id } => {
                let guard = indices.read().await;
                if let Some(conns) = guard.by_user.get(&user_id) {
                    for conn_id in conns {
                        if let Some(handle) = guard.conns.get(conn_id) {
                            handle.offer(Outbound::Close);
                        }
                    }
                }
            }
            HubCommand::Flush { done } => {
                let _ = done.send(());
            }
            HubCommand::Shutdown { done } => {
                let reconnect: Arc<str> = match Frame::bare(OpCode::Reconnect).encode() {
                    Ok(text) => text.into(),
                    Err(_) => Arc::from("{\"op\":13}"),
                };
                let mut guard = indices.write().await;
                for handle in guard.conns.values() {
                    handle.offer(Outbound::Frame(Arc::clone(&reconnect)));
                    handle.offer(Outbound::Close);
                }
                guard.conns.clear();
                guard.by_user.clear();
                guard.by_server.clear();
                guard.by_channel.clear();
                drop(guard);
                let _ = done.send(());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_protocol::events::{Event, TypingStartPayload};
    use concord_protocol::EventName;

    fn typing_event() -> (ChannelId, Event) {
        let channel_id = Uuid::new_v4();
        (
            channel_id,
            Event::TypingStart(TypingStartPayload { channel_id, user_id: Uuid::new_v4() }),
        )
    }

    async fn registered_conn(
        hub: &Hub,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> (ConnId, UserId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let conn_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        hub.register(
            ClientHandle::new(conn_id, user_id, tx),
            vec![server_id],
            vec![channel_id],
        )
        .await;
        (conn_id, user_id, rx)
    }

    fn frame_of(item: Outbound) -> Frame {
        match item {
            Outbound::Frame(text) => Frame::decode(&text).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_indexes_connection_everywhere_and_unregister_clears_it() {
        let hub = Hub::spawn();
        let server_id = Uuid::new_v4();
        let channel_id = Uuid::new_v4();
        let (conn_id, user_id, _rx) = registered_conn(&hub, server_id, channel_id).await;

        hub.flush().await;
        assert_eq!(hub.connection_count().await, 1);
        let (known, servers, channels) = hub.membership(conn_id).await;
        assert!(known);
        assert_eq!(servers, vec![server_id]);
        assert_eq!(channels, vec![channel_id]);
        assert!(hub.is_user_online(user_id).await);
        assert_eq!(hub.online_users(server_id).await, vec![user_id]);

        hub.unregister(conn_id).await;
        hub.flush().await;
        assert_eq!(hub.connection_count().await, 0);
        let (known, servers, channels) = hub.membership(conn_id).await;
        assert!(!known);
        assert!(servers.is_empty());
        assert!(channels.is_empty());
        assert!(!hub.is_user_online(user_id).await);
    }

    #[tokio::test]
    async fn broadcast_stamps_strictly_increasing_sequence_numbers() {
        let hub = Hub::spawn();
        let server_id = Uuid::new_v4();
        let (channel_id, _) = typing_event();
        let (_, _, mut rx) = registered_conn(&hub, server_id, channel_id).await;

        for _ in 0..3 {
            let (_, event) = typing_event();
            hub.dispatch(Target::Server(server_id), event).await;
        }

        let mut last = 0;
        for _ in 0..3 {
            let frame = frame_of(rx.recv().await.unwrap());
            let seq = frame.s.unwrap();
            assert!(seq > last, "sequence must strictly increase: {seq} after {last}");
            last = seq;
        }
    }

    #[tokio::test]
    async fn channel_broadcast_reaches_subscribers_and_honors_exclusion() {
        let hub = Hub::spawn();
        let server_id = Uuid::new_v4();
        let channel_id = Uuid::new_v4();
        let (_, alice, mut alice_rx) = registered_conn(&hub, server_id, channel_id).await;
        let (_, _bob, mut bob_rx) = registered_conn(&hub, server_id, channel_id).await;

        let event = Event::TypingStart(TypingStartPayload { channel_id, user_id: alice });
        hub.broadcast(BroadcastMessage {
            target: Target::Channel(channel_id),
            exclude_user: Some(alice),
            event,
        })
        .await;

        let frame = frame_of(bob_rx.recv().await.unwrap());
        assert_eq!(frame.t, Some(EventName::TypingStart));
        assert_eq!(frame.s, Some(1));

        // Alice was excluded from the first broadcast: her queue starts at
        // the second one.
        hub.dispatch(
            Target::Channel(channel_id),
            Event::TypingStart(TypingStartPayload { channel_id, user_id: Uuid::new_v4() }),
        )
        .await;
        let next = frame_of(alice_rx.recv().await.unwrap());
        assert_eq!(next.s, Some(2));
    }

    #[tokio::test]
    async fn full_queue_drops_frames_without_blocking_the_hub() {
        let hub = Hub::spawn();
        let server_id = Uuid::new_v4();
        let channel_id = Uuid::new_v4();
        // Capacity 1: the second frame must be dropped, not awaited.
        let (tx, mut rx) = mpsc::channel(1);
        let conn_id = Uuid::new_v4();
        hub.register(
            ClientHandle::new(conn_id, Uuid::new_v4(), tx),
            vec![server_id],
            vec![channel_id],
        )
        .await;

        for _ in 0..3 {
            let event = Event::TypingStart(TypingStartPayload {
                channel_id,
                user_id: Uuid::new_v4(),
            });
            hub.dispatch(Target::Channel(channel_id), event).await;
        }
        // The hub stayed live; exactly one frame is queued.
        hub.flush().await;
        assert_eq!(hub.connection_count().await, 1);
        let first = frame_of(rx.recv().await.unwrap());
        assert_eq!(first.s, Some(1));
        assert!(rx.try_recv().is_err(), "overflow frames must be dropped");
    }

    #[tokio::test]
    async fn subscribe_channel_picks_up_online_server_members() {
        let hub = Hub::spawn();
        let server_id = Uuid::new_v4();
        let old_channel = Uuid::new_v4();
        let (conn_id, _, mut rx) = registered_conn(&hub, server_id, old_channel).await;

        let new_channel = Uuid::new_v4();
        hub.subscribe_channel(server_id, new_channel).await;
        hub.flush().await;
        let (_, _, channels) = hub.membership(conn_id).await;
        assert!(channels.contains(&new_channel));

        hub.dispatch(
            Target::Channel(new_channel),
            Event::TypingStart(TypingStartPayload {
                channel_id: new_channel,
                user_id: Uuid::new_v4(),
            }),
        )
        .await;
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));
    }

    #[tokio::test]
    async fn shutdown_sends_reconnect_then_close_to_every_connection() {
        let hub = Hub::spawn();
        let server_id = Uuid::new_v4();
        let channel_id = Uuid::new_v4();
        let (_, _, mut rx) = registered_conn(&hub, server_id, channel_id).await;

        hub.shutdown().await;
        let frame = frame_of(rx.recv().await.unwrap());
        assert_eq!(frame.op, OpCode::Reconnect);
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
        assert_eq!(hub.connection_count().await, 0);
    }
}
