//! Full-stack scenarios: the real client library against the real server.

use std::net::SocketAddr;
use std::time::Duration;

use client::event_loop::ClientState;
use client::events::{ConnEvent, ConnState};
use client::storage::{ClientServerInfo, Identity, SavedCredentials};
use client::{ConnectionManager, ReconnectPolicy, UnreadTracker};
use concord_protocol::SendMessageCommand;
use server::store::Store;
use server::AppState;

async fn spawn_server() -> (SocketAddr, AppState) {
    let mut store = Store::open_in_memory().expect("open store");
    server::bootstrap(&mut store, None).expect("bootstrap");
    let state = AppState::new(store);
    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    (addr, state)
}

fn endpoint_for(addr: SocketAddr) -> ClientServerInfo {
    ClientServerInfo::new("local", &addr.ip().to_string(), addr.port(), false)
}

fn identity(alias: &str) -> Identity {
    Identity {
        alias: alias.to_owned(),
        email: format!("{alias}@x"),
        password: "pw12345678".to_owned(),
    }
}

/// Drive scoped events into a `ClientState` until `predicate` holds.
async fn apply_until(
    rx: &mut tokio::sync::mpsc::Receiver<client::ServerScopedMsg>,
    state: &mut ClientState,
    deadline: Duration,
    mut predicate: impl FnMut(&ClientState) -> bool,
) -> bool {
    let step = async {
        while let Some(msg) = rx.recv().await {
            state.apply(msg);
            if predicate(state) {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(deadline, step).await.unwrap_or(false)
}

#[tokio::test]
async fn fresh_identity_auto_registers_connects_and_chats() {
    let (addr, _server_state) = spawn_server().await;
    let info = endpoint_for(addr);
    let endpoint_id = info.id;

    // No account exists: the flow falls through login to registration.
    let (manager, mut event_rx) =
        ConnectionManager::new(Some(identity("alice")), ReconnectPolicy::default());
    manager.add_endpoint(info).await;

    let mut state = ClientState::new("alice", UnreadTracker::new());
    let became_ready = apply_until(&mut event_rx, &mut state, Duration::from_secs(10), |s| {
        s.endpoints
            .get(&endpoint_id)
            .and_then(|e| e.conn_state.as_ref())
            .is_some_and(ConnState::is_ready)
    })
    .await;
    assert!(became_ready, "endpoint must reach Ready");

    // READY + SERVER_CREATE populated the default guild. The tree may have
    // filled before the readiness predicate fired, so don't require another
    // event here.
    let populated = state.endpoints[&endpoint_id]
        .trees
        .values()
        .any(|t| !t.is_empty())
        || apply_until(&mut event_rx, &mut state, Duration::from_secs(5), |s| {
            s.endpoints[&endpoint_id]
                .trees
                .values()
                .any(|t| !t.is_empty())
        })
        .await;
    assert!(populated, "guild snapshot must arrive");
    let channel_id = state.endpoints[&endpoint_id]
        .trees
        .values()
        .flat_map(|t| t.flat_list().iter())
        .map(|e| e.channel_id)
        .next()
        .expect("a channel");

    let sent = manager
        .send_message(
            endpoint_id,
            SendMessageCommand {
                channel_id,
                content: "hi".to_owned(),
                nonce: Some("n-1".to_owned()),
                reply_to_id: None,
            },
        )
        .await;
    assert!(sent);

    let echoed = apply_until(&mut event_rx, &mut state, Duration::from_secs(5), |s| {
        s.endpoints[&endpoint_id]
            .messages
            .get(&channel_id)
            .is_some_and(|m| m.iter().any(|m| m.content == "hi"))
    })
    .await;
    assert!(echoed, "own MESSAGE_CREATE must come back");

    let ep = &state.endpoints[&endpoint_id];
    let message = ep.messages[&channel_id]
        .iter()
        .find(|m| m.content == "hi")
        .expect("message");
    let author = ep.user.as_ref().expect("own user");
    assert_eq!(message.author_id, author.id);
    assert_eq!(author.username, "alice");

    manager.close().await;
}

#[tokio::test]
async fn stale_token_recovers_through_http_login_within_one_cycle() {
    let (addr, _server_state) = spawn_server().await;

    // The account already exists; only our token is stale.
    let api = client::api::AuthApi::new(format!("http://{addr}"));
    api.register("alice", "a@x", "pw12345678")
        .await
        .expect("pre-register");

    let mut info = endpoint_for(addr);
    info.saved_credentials = Some(SavedCredentials {
        email: "a@x".to_owned(),
        token: Some("stale-token-from-last-run".to_owned()),
        auto_connect: true,
        remember: true,
    });
    let endpoint_id = info.id;

    let identity = Identity {
        alias: "alice".to_owned(),
        email: "a@x".to_owned(),
        password: "pw12345678".to_owned(),
    };
    let (manager, mut event_rx) =
        ConnectionManager::new(Some(identity), ReconnectPolicy::default());
    manager.add_endpoint(info).await;

    // The stale token must surface InvalidSession, then the login path must
    // land us in Ready without burning a reconnect attempt.
    let mut saw_invalid_session = false;
    let mut state = ClientState::new("alice", UnreadTracker::new());
    let became_ready = {
        let step = async {
            while let Some(msg) = event_rx.recv().await {
                if matches!(msg.inner, ConnEvent::InvalidSession { .. }) {
                    saw_invalid_session = true;
                }
                state.apply(msg);
                let ready = state
                    .endpoints
                    .get(&endpoint_id)
                    .and_then(|e| e.conn_state.as_ref())
                    .is_some_and(ConnState::is_ready);
                if ready {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(Duration::from_secs(10), step)
            .await
            .unwrap_or(false)
    };
    assert!(became_ready, "recovery must end in Ready");
    assert!(saw_invalid_session, "the stale token must be rejected first");

    manager.close().await;
}

#[tokio::test]
async fn unreachable_endpoint_goes_terminal_after_max_attempts() {
    // Nothing listens on this port; use a tiny policy so the test is fast.
    let info = ClientServerInfo::new("nowhere", "127.0.0.1", 1, false);
    let endpoint_id = info.id;
    let policy = ReconnectPolicy {
        initial: Duration::from_millis(10),
        factor: 2.0,
        max_delay: Duration::from_millis(40),
        max_attempts: 2,
    };

    let (manager, mut event_rx) = ConnectionManager::new(Some(identity("alice")), policy);
    manager.add_endpoint(info).await;

    let mut reconnecting_seen = 0;
    let mut terminal: Option<String> = None;
    let watch = async {
        while let Some(msg) = event_rx.recv().await {
            if msg.endpoint_id != endpoint_id {
                continue;
            }
            match msg.inner {
                ConnEvent::StateChanged(ConnState::Reconnecting) => reconnecting_seen += 1,
                ConnEvent::StateChanged(ConnState::Error(reason)) => {
                    terminal = Some(reason);
                    break;
                }
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), watch)
        .await
        .expect("must go terminal");

    assert_eq!(reconnecting_seen, 2, "one Reconnecting per allowed retry");
    let reason = terminal.expect("terminal error");
    assert!(reason.contains("gave up"), "unexpected reason: {reason}");

    manager.close().await;
}
