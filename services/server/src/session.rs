//! Per-connection WebSocket session.
//!
//! The handshake runs on the raw socket: Hello goes out immediately, and the
//! connection sits in `AwaitingIdentify` until a valid Identify arrives (any
//! other opcode is answered with `Unauthorized` and the connection stays
//! open). After authentication the socket splits into a read task and a
//! write task joined by the connection's bounded send queue.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use concord_protocol::{
    ErrorCode, Frame, Hello, Identify, InvalidSession, OpCode, Status, HEARTBEAT_INTERVAL_MS,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::handlers::{self, SessionCtx};
use crate::hub::{ClientHandle, Outbound, SEND_QUEUE_CAPACITY};
use crate::state::AppState;

/// Read deadline; refreshed by every inbound frame, including pongs.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Transport pings go out at 90% of the read-deadline window.
const PING_INTERVAL: Duration = Duration::from_secs(54);
/// Every queue drain gets this long to reach the socket.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Grace between InvalidSession and the close frame, so the client sees the
/// reason before the transport drops.
const INVALID_SESSION_CLOSE_DELAY: Duration = Duration::from_millis(100);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    match frame.encode() {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            false
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let hello = match Frame::with_payload(
        OpCode::Hello,
        &Hello { heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS },
    ) {
        Ok(frame) => frame,
        Err(_) => return,
    };
    if !send_frame(&mut socket, &hello).await {
        return;
    }

    // AwaitingIdentify: the first accepted command must be Identify.
    let session = loop {
        let msg = match tokio::time::timeout(READ_DEADLINE, socket.recv()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(_) => return,
            Err(_) => {
                debug!("read deadline expired before Identify");
                return;
            }
        };
        match msg {
            Message::Text(text) => {
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = send_frame(
                            &mut socket,
                            &Frame::error(ErrorCode::InvalidPayload, e.to_string()),
                        )
                        .await;
                        return;
                    }
                };
                if frame.op != OpCode::Identify {
                    let _ = send_frame(
                        &mut socket,
                        &Frame::error(ErrorCode::Unauthorized, "identify first"),
                    )
                    .await;
                    continue;
                }
                let identify: Identify = match frame.payload() {
                    Ok(identify) => identify,
                    Err(e) => {
                        let _ = send_frame(
                            &mut socket,
                            &Frame::error(ErrorCode::InvalidPayload, e.to_string()),
                        )
                        .await;
                        continue;
                    }
                };
                let record = {
                    let store = state.store.lock().await;
                    auth::validate_token(&store, &identify.token)
                };
                match record {
                    Ok(Some(record)) => break record,
                    Ok(None) => {
                        invalid_session(&mut socket, "unknown or expired token").await;
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "token validation failed");
                        let _ = send_frame(
                            &mut socket,
                            &Frame::error(ErrorCode::ServerError, "token validation failed"),
                        )
                        .await;
                        return;
                    }
                }
            }
            Message::Ping(data) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Message::Close(_) => return,
            _ => {}
        }
    };

    // Authenticated: snapshot the user's world, register with the hub, and
    // split into the two pumps.
    let conn_id = Uuid::new_v4();
    let loaded = {
        let store = state.store.lock().await;
        load_session_world(&store, session.user_id)
    };
    let (user, snapshots, server_ids, channel_ids) = match loaded {
        Ok(Some(loaded)) => loaded,
        Ok(None) => {
            invalid_session(&mut socket, "user no longer exists").await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "failed to load session state");
            let _ = send_frame(
                &mut socket,
                &Frame::error(ErrorCode::ServerError, "failed to load session state"),
            )
            .await;
            return;
        }
    };

    info!(conn_id = %conn_id, user_id = %user.id, username = %user.username, "session authenticated");

    let (out_tx, out_rx) = mpsc::channel::<Outbound>(SEND_QUEUE_CAPACITY);
    let ctx = SessionCtx {
        state: state.clone(),
        conn_id,
        session_id: session.session_id.clone(),
        user_id: user.id,
        out: out_tx.clone(),
    };

    state
        .hub
        .register(
            ClientHandle::new(conn_id, user.id, out_tx),
            server_ids.clone(),
            channel_ids,
        )
        .await;
    // READY first: everything addressed to this connection must start with
    // it. The online fan-out excludes the user's own connection, which
    // already carries the online status inside READY.
    let servers = snapshots_servers(&snapshots);
    handlers::emit_ready(&ctx, user.clone(), snapshots).await;
    handlers::broadcast_presence(&ctx, &servers, Status::Online, "", Some(user.id)).await;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, out_rx));
    read_pump(stream, &ctx).await;

    // Deregister atomically: out of every index, queue closed once.
    state.hub.unregister(conn_id).await;
    {
        let store = state.store.lock().await;
        if let Err(e) = store.set_user_status(user.id, Status::Offline, None) {
            warn!(error = %e, "failed to mark user offline");
        }
    }
    let servers = {
        let store = state.store.lock().await;
        store.servers_for_user(user.id).unwrap_or_default()
    };
    handlers::broadcast_presence(&ctx, &servers, Status::Offline, "", None).await;
    drop(ctx);
    let _ = writer.await;
    info!(conn_id = %conn_id, user_id = %user.id, "session closed");
}

type SessionWorld = (
    concord_protocol::User,
    Vec<concord_protocol::GuildSnapshot>,
    Vec<concord_protocol::ServerId>,
    Vec<concord_protocol::ChannelId>,
);

fn load_session_world(
    store: &crate::store::Store,
    user_id: concord_protocol::UserId,
) -> Result<Option<SessionWorld>, crate::store::StoreError> {
    if store.user_by_id(user_id)?.is_none() {
        return Ok(None);
    }
    store.set_user_status(user_id, Status::Online, None)?;
    let user = store
        .user_by_id(user_id)?
        .ok_or(crate::store::StoreError::NotFound)?;
    let servers = store.servers_for_user(user_id)?;
    let mut snapshots = Vec::with_capacity(servers.len());
    let mut server_ids = Vec::with_capacity(servers.len());
    let mut channel_ids = Vec::new();
    for server in &servers {
        let snapshot = store.guild_snapshot(server.id)?;
        server_ids.push(server.id);
        channel_ids.extend(snapshot.channels.iter().map(|c| c.id));
        snapshots.push(snapshot);
    }
    Ok(Some((user, snapshots, server_ids, channel_ids)))
}

fn snapshots_servers(snapshots: &[concord_protocol::GuildSnapshot]) -> Vec<concord_protocol::Server> {
    snapshots.iter().map(|s| s.server.clone()).collect()
}

async fn invalid_session(socket: &mut WebSocket, reason: &str) {
    let frame = match Frame::with_payload(
        OpCode::InvalidSession,
        &InvalidSession { reason: reason.to_owned() },
    ) {
        Ok(frame) => frame,
        Err(_) => return,
    };
    let _ = send_frame(socket, &frame).await;
    tokio::time::sleep(INVALID_SESSION_CLOSE_DELAY).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Read task: 512 KiB frame cap (enforced by the codec), 60 s deadline
/// refreshed by every frame including pongs. Any transport-level violation
/// ends the task, which triggers deregistration in the caller.
async fn read_pump(mut stream: SplitStream<WebSocket>, ctx: &SessionCtx) {
    loop {
        let msg = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(conn_id = %ctx.conn_id, error = %e, "transport error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(conn_id = %ctx.conn_id, "read deadline expired");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Undecodable or oversized: tell them why, then drop
                        // the connection.
                        ctx.offer(&Frame::error(ErrorCode::InvalidPayload, e.to_string()));
                        break;
                    }
                };
                if let Err(e) = handlers::handle_frame(ctx, frame).await {
                    ctx.offer_error(&e);
                }
            }
            Message::Ping(data) => {
                let _ = ctx.out.try_send(Outbound::Pong(data));
            }
            // Pongs only refresh the deadline.
            Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) => {
                ctx.offer(&Frame::error(
                    ErrorCode::InvalidPayload,
                    "binary frames are not part of this protocol",
                ));
                break;
            }
        }
    }
}

/// Write task: drains the bounded queue, stamps a 10 s deadline on every
/// send, pings on the idle interval, and always emits a normal-closure frame
/// on the way out.
async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(Outbound::Frame(text)) => {
                        let send = sink.send(Message::Text(text.to_string()));
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
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.flush().await;
}

