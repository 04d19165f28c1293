//! One supervised connection to one remote endpoint.
//!
//! `connect` dials, consumes the server's Hello, and starts the two pumps;
//! `identify` then drives the authenticate-then-READY handshake. The read
//! task is the only writer of the per-endpoint caches, and everything it
//! learns is forwarded onto the manager's scoped event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use concord_protocol::events::{Event, GuildSnapshot, MemberProfile};
use concord_protocol::{
    Channel, ChannelId, Frame, FrameError, HeartbeatCommand, Hello, Identify, InvalidSession,
    Message, OpCode, ServerId,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::events::{ConnEvent, ConnState, EndpointId, ServerScopedMsg};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read deadline; refreshed by every inbound frame including pongs.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Pings at 90% of the read-deadline window.
const PING_INTERVAL: Duration = Duration::from_secs(54);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("WS: {0}")]
    Ws(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("expected Hello, got something else")]
    NoHello,
    #[error("session rejected: {0}")]
    InvalidSession(String),
    #[error("auth flow failed: {0}")]
    Auth(String),
    #[error("connection closed during handshake")]
    Closed,
}

enum Outbound {
    Frame(Frame),
    Pong(Vec<u8>),
}

/// Per-endpoint derived caches. Written only by the owning read task, read
/// by the event loop and the UI.
#[derive(Default)]
pub struct Caches {
    pub channels: RwLock<HashMap<ServerId, Vec<Channel>>>,
    pub messages: RwLock<HashMap<ChannelId, Vec<Message>>>,
    pub members: RwLock<HashMap<ServerId, Vec<MemberProfile>>>,
}

/// Messages kept per channel before old ones are evicted; history beyond
/// this is re-fetched on demand.
const MESSAGE_CACHE_CAP: usize = 500;

pub struct ServerConnection {
    pub endpoint_id: EndpointId,
    state_tx: watch::Sender<ConnState>,
    events_tx: mpsc::Sender<ServerScopedMsg>,
    out_tx: mpsc::Sender<Outbound>,
    shutdown_tx: watch::Sender<bool>,
    last_seq: AtomicU64,
    invalid_session: AtomicBool,
    closed_once: AtomicBool,
    pub caches: Caches,
}

impl ServerConnection {
    /// Dial the endpoint and run the Hello handshake. The returned
    /// connection is `Connected` but not yet identified.
    pub async fn connect(
        endpoint_id: EndpointId,
        ws_url: &str,
        events_tx: mpsc::Sender<ServerScopedMsg>,
    ) -> Result<Arc<Self>, ConnectError> {
        let _ = events_tx
            .send(ServerScopedMsg {
                endpoint_id,
                inner: ConnEvent::StateChanged(ConnState::Connecting),
            })
            .await;

        let (mut ws, _response) = connect_async(ws_url).await.map_err(Box::new)?;
        let hello = read_hello(&mut ws).await?;
        debug!(
            endpoint_id = %endpoint_id,
            heartbeat_ms = hello.heartbeat_interval_ms,
            "connected"
        );

        let (state_tx, _) = watch::channel(ConnState::Connected);
        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            endpoint_id,
            state_tx,
            events_tx: events_tx.clone(),
            out_tx,
            shutdown_tx,
            last_seq: AtomicU64::new(0),
            invalid_session: AtomicBool::new(false),
            closed_once: AtomicBool::new(false),
            caches: Caches::default(),
        });
        let _ = events_tx
            .send(ServerScopedMsg {
                endpoint_id,
                inner: ConnEvent::StateChanged(ConnState::Connected),
            })
            .await;

        let (sink, stream) = ws.split();
        tokio::spawn(write_pump(sink, out_rx, shutdown_rx.clone()));
        tokio::spawn(heartbeat_pump(
            Arc::clone(&conn),
            Duration::from_millis(hello.heartbeat_interval_ms),
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_pump(stream, Arc::clone(&conn), shutdown_rx));

        Ok(conn)
    }

    pub fn state(&self) -> ConnState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Relaxed)
    }

    async fn set_state(&self, state: ConnState) {
        self.state_tx.send_replace(state.clone());
        let _ = self
            .events_tx
            .send(ServerScopedMsg {
                endpoint_id: self.endpoint_id,
                inner: ConnEvent::StateChanged(state),
            })
            .await;
    }

    /// Send Identify. The caller must have published this connection as the
    /// endpoint's active one first: READY can arrive on the read task before
    /// this call returns.
    pub async fn identify(&self, token: &str) -> Result<(), FrameError> {
        self.set_state(ConnState::Authenticating).await;
        let frame = Frame::with_payload(
            OpCode::Identify,
            &Identify { token: token.to_owned(), properties: None },
        )?;
        self.send(frame);
        Ok(())
    }

    /// Wait for the handshake to settle: `Ready`, or the reason it failed.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), ConnectError> {
        let mut state_rx = self.watch_state();
        let wait = async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnState::Ready => return Ok(()),
                    ConnState::Error(reason) => {
                        if self.invalid_session.load(Ordering::Relaxed) {
                            return Err(ConnectError::InvalidSession(reason));
                        }
                        return Err(ConnectError::Closed);
                    }
                    ConnState::Disconnected => return Err(ConnectError::Closed),
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(ConnectError::Closed);
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| ConnectError::Timeout)?
    }

    /// Non-blocking enqueue onto the bounded outbound queue; drops on a
    /// full queue rather than stalling the caller.
    pub fn send(&self, frame: Frame) {
        if self.out_tx.try_send(Outbound::Frame(frame)).is_err() {
            warn!(endpoint_id = %self.endpoint_id, "outbound queue full or closed, dropping frame");
        }
    }

    pub fn send_heartbeat(&self) {
        let seq = self.last_seq();
        let payload = HeartbeatCommand { seq: (seq > 0).then_some(seq) };
        match Frame::with_payload(OpCode::Heartbeat, &payload) {
            Ok(frame) => self.send(frame),
            Err(e) => warn!(error = %e, "failed to build heartbeat"),
        }
    }

    /// Tear the pumps down. Idempotent; the send queue is closed exactly
    /// once.
    pub fn disconnect(&self) {
        if self.closed_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
    }

    async fn forward(&self, inner: ConnEvent) {
        let _ = self
            .events_tx
            .send(ServerScopedMsg { endpoint_id: self.endpoint_id, inner })
            .await;
    }
}

async fn read_hello(ws: &mut WsStream) -> Result<Hello, ConnectError> {
    loop {
        let msg = tokio::time::timeout(HELLO_TIMEOUT, ws.next())
            .await
            .map_err(|_| ConnectError::Timeout)?;
        match msg {
            Some(Ok(WsMessage::Text(text))) => {
                let frame = Frame::decode(&text)?;
                if frame.op != OpCode::Hello {
                    return Err(ConnectError::NoHello);
                }
                return Ok(frame.payload()?);
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            Some(Ok(WsMessage::Close(_))) | None => return Err(ConnectError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ConnectError::Ws(Box::new(e))),
        }
    }
}

async fn read_pump(
    mut stream: SplitStream<WsStream>,
    conn: Arc<ServerConnection>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            msg = tokio::time::timeout(READ_DEADLINE, stream.next()) => msg,
        };
        let msg = match msg {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(endpoint_id = %conn.endpoint_id, error = %e, "transport error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(endpoint_id = %conn.endpoint_id, "read deadline expired");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(endpoint_id = %conn.endpoint_id, error = %e, "undecodable frame");
                        break;
                    }
                };
                if handle_frame(&conn, frame).await.is_break() {
                    break;
                }
            }
            WsMessage::Ping(data) => {
                let _ = conn.out_tx.try_send(Outbound::Pong(data.into()));
            }
            // Pongs only refresh the read deadline.
            WsMessage::Pong(_) => {}
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    if !matches!(conn.state(), ConnState::Error(_)) {
        conn.state_tx.send_replace(ConnState::Disconnected);
    }
    conn.forward(ConnEvent::Closed).await;
    conn.disconnect();
}

async fn handle_frame(
    conn: &Arc<ServerConnection>,
    frame: Frame,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    match frame.op {
        OpCode::Dispatch => {
            let seq = frame.s.unwrap_or(0);
            if seq > 0 {
                conn.last_seq.store(seq, Ordering::Relaxed);
            }
            match Event::from_frame(&frame) {
                Ok(Some(event)) => {
                    apply_to_caches(conn, &event).await;
                    if matches!(event, Event::Ready(_)) {
                        conn.set_state(ConnState::Ready).await;
                    }
                    conn.forward(ConnEvent::Dispatch { seq, event }).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(endpoint_id = %conn.endpoint_id, error = %e, "bad dispatch payload");
                }
            }
            ControlFlow::Continue(())
        }
        OpCode::HeartbeatAck => ControlFlow::Continue(()),
        OpCode::InvalidSession => {
            let reason = frame
                .payload::<Option<InvalidSession>>()
                .ok()
                .flatten()
                .map_or_else(|| "invalid session".to_owned(), |p| p.reason);
            conn.invalid_session.store(true, Ordering::Relaxed);
            conn.state_tx.send_replace(ConnState::Error(reason.clone()));
            conn.forward(ConnEvent::InvalidSession { reason }).await;
            ControlFlow::Break(())
        }
        OpCode::Reconnect => {
            conn.forward(ConnEvent::Reconnect).await;
            ControlFlow::Break(())
        }
        OpCode::Error => {
            if let Ok(payload) = frame.payload() {
                conn.forward(ConnEvent::ProtocolError(payload)).await;
            }
            ControlFlow::Continue(())
        }
        _ => ControlFlow::Continue(()),
    }
}

/// Cache application for dispatches that carry canonical state. The event
/// loop keeps its own derived views; these caches are what the UI reads
/// synchronously.
async fn apply_to_caches(conn: &Arc<ServerConnection>, event: &Event) {
    match event {
        Event::Ready(ready) => {
            for snapshot in &ready.servers {
                apply_guild(conn, snapshot).await;
            }
        }
        Event::ServerCreate(snapshot) => apply_guild(conn, snapshot).await,
        Event::MessageCreate(payload) => {
            let mut messages = conn.caches.messages.write().await;
            let entry = messages.entry(payload.message.channel_id).or_default();
            entry.push(payload.message.clone());
            if entry.len() > MESSAGE_CACHE_CAP {
                let excess = entry.len() - MESSAGE_CACHE_CAP;
                entry.drain(..excess);
            }
        }
        Event::SystemMessage(payload) => {
            let mut messages = conn.caches.messages.write().await;
            messages
                .entry(payload.message.channel_id)
                .or_default()
                .push(payload.message.clone());
        }
        Event::MessageDelete(payload) => {
            let mut messages = conn.caches.messages.write().await;
            if let Some(entry) = messages.get_mut(&payload.channel_id) {
                entry.retain(|m| m.id != payload.message_id);
            }
        }
        Event::MessagesHistory(payload) => {
            let mut messages = conn.caches.messages.write().await;
            let entry = messages.entry(payload.channel_id).or_default();
            for message in payload.messages.iter().rev() {
                if !entry.iter().any(|m| m.id == message.id) {
                    entry.insert(0, message.clone());
                }
            }
        }
        Event::ChannelCreate(payload) | Event::ChannelUpdate(payload) => {
            let mut channels = conn.caches.channels.write().await;
            let entry = channels.entry(payload.channel.server_id).or_default();
            entry.retain(|c| c.id != payload.channel.id);
            entry.push(payload.channel.clone());
            entry.sort_by(|a, b| a.position.cmp(&b.position).then(a.name.cmp(&b.name)));
        }
        Event::ChannelDelete(payload) => {
            let mut channels = conn.caches.channels.write().await;
            if let Some(entry) = channels.get_mut(&payload.server_id) {
                entry.retain(|c| c.id != payload.channel_id);
            }
            conn.caches.messages.write().await.remove(&payload.channel_id);
        }
        Event::ServerMemberAdd(payload) => {
            let mut members = conn.caches.members.write().await;
            let entry = members.entry(payload.server_id).or_default();
            entry.retain(|m| m.member.user_id != payload.profile.member.user_id);
            entry.push(payload.profile.clone());
        }
        Event::ServerMemberRemove(payload) => {
            let mut members = conn.caches.members.write().await;
            if let Some(entry) = members.get_mut(&payload.server_id) {
                entry.retain(|m| m.member.user_id != payload.user_id);
            }
        }
        Event::ServerMemberUpdate(payload) => {
            let mut members = conn.caches.members.write().await;
            if let Some(entry) = members.get_mut(&payload.server_id) {
                if let Some(profile) = entry
                    .iter_mut()
                    .find(|m| m.member.user_id == payload.member.user_id)
                {
                    profile.member = payload.member.clone();
                }
            }
        }
        Event::PresenceUpdate(payload) => {
            let mut members = conn.caches.members.write().await;
            for entry in members.values_mut() {
                if let Some(profile) = entry
                    .iter_mut()
                    .find(|m| m.member.user_id == payload.user_id)
                {
                    profile.user.status = payload.status;
                    profile.user.status_text.clone_from(&payload.status_text);
                }
            }
        }
        // Typing, whispers, and reactions are ephemeral view state; the
        // event loop owns them.
        Event::TypingStart(_)
        | Event::WhisperCreate(_)
        | Event::MessageReactionAdd(_)
        | Event::MessageReactionRemove(_) => {}
    }
}

async fn apply_guild(conn: &Arc<ServerConnection>, snapshot: &GuildSnapshot) {
    let server_id = snapshot.server.id;
    conn.caches
        .channels
        .write()
        .await
        .insert(server_id, snapshot.channels.clone());
    conn.caches
        .members
        .write()
        .await
        .insert(server_id, snapshot.members.clone());
}

async fn write_pump(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            item = rx.recv() => {
                match item {
                    Some(Outbound::Frame(frame)) => {
                        let text = match frame.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to encode outbound frame");
                                continue;
                            }
                        };
                        let send = sink.send(WsMessage::Text(text.into()));
                        match tokio::time::timeout(WRITE_DEADLINE, send).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(error = %e, "write failed");
                                break;
                            }
                            Err(_) => {
                                warn!("write deadline expired");
                                break;
                            }
                        }
                    }
                    Some(Outbound::Pong(data)) => {
                        if sink.send(WsMessage::Pong(data.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    // Normal closure on the way out, whatever got us here.
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.flush().await;
}

async fn heartbeat_pump(
    conn: Arc<ServerConnection>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate tick
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !matches!(conn.state(), ConnState::Ready | ConnState::Authenticating) {
                    continue;
                }
                conn.send_heartbeat();
            }
        }
    }
}
