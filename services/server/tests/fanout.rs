//! Hub fan-out over real connections: message echo, multi-client delivery,
//! typing exclusion, whispers.

use concord_protocol::{
    ChannelId, Event, EventName, Frame, OpCode, SendMessageCommand, TypingStartCommand,
    WhisperCommand,
};
use concord_test_utils::MockWsClient;
use server::store::Store;
use server::AppState;
use std::net::SocketAddr;

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

async fn seed_user(state: &AppState, username: &str, email: &str) -> (concord_protocol::User, String) {
    let mut store = state.store.lock().await;
    let user = store
        .create_user(username, username, email, "hash", "salt")
        .expect("create user");
    let default = store
        .server_by_name(server::http::DEFAULT_SERVER_NAME)
        .expect("query")
        .expect("default server");
    store.add_member(default.id, user.id).expect("join");
    let (token, _) = server::auth::issue_session(&store, user.id).expect("session");
    (user, token)
}

async fn general_channel(state: &AppState) -> ChannelId {
    let store = state.store.lock().await;
    let default = store
        .server_by_name(server::http::DEFAULT_SERVER_NAME)
        .expect("query")
        .expect("default server");
    store
        .default_channel(default.id)
        .expect("query")
        .expect("general exists")
        .id
}

async fn send_message(client: &mut MockWsClient, channel_id: ChannelId, content: &str) {
    let frame = Frame::with_payload(
        OpCode::SendMessage,
        &SendMessageCommand {
            channel_id,
            content: content.to_owned(),
            nonce: Some(format!("nonce-{content}")),
            reply_to_id: None,
        },
    )
    .expect("frame");
    client.send_frame(&frame).await.expect("send");
}

#[tokio::test]
async fn single_client_echo_returns_the_message_with_author() {
    let (addr, state) = spawn_server().await;
    let (_alice, token) = seed_user(&state, "alice", "a@x").await;
    let channel = general_channel(&state).await;

    let mut client = MockWsClient::connect_identified(&format!("ws://{addr}/ws"), &token)
        .await
        .expect("handshake");
    send_message(&mut client, channel, "hi").await;

    let (event, _seq) = client
        .expect_event(EventName::MessageCreate)
        .await
        .expect("message create");
    let Event::MessageCreate(payload) = event else {
        panic!("expected MESSAGE_CREATE");
    };
    assert_eq!(payload.message.content, "hi");
    assert_eq!(payload.message.channel_id, channel);
    assert_eq!(payload.author.username, "alice");
    assert_eq!(payload.nonce.as_deref(), Some("nonce-hi"));
}

#[tokio::test]
async fn message_create_fans_out_to_everyone_including_the_sender() {
    let (addr, state) = spawn_server().await;
    let (_alice, alice_token) = seed_user(&state, "alice", "a@x").await;
    let (_bob, bob_token) = seed_user(&state, "bob", "b@x").await;
    let channel = general_channel(&state).await;
    let url = format!("ws://{addr}/ws");

    let mut alice = MockWsClient::connect_identified(&url, &alice_token)
        .await
        .expect("alice handshake");
    let mut bob = MockWsClient::connect_identified(&url, &bob_token)
        .await
        .expect("bob handshake");

    send_message(&mut alice, channel, "ping").await;

    let (event, _) = bob
        .expect_event(EventName::MessageCreate)
        .await
        .expect("bob receives");
    let Event::MessageCreate(payload) = event else {
        panic!("expected MESSAGE_CREATE");
    };
    assert_eq!(payload.message.content, "ping");

    // No sender exclusion on MESSAGE_CREATE.
    let (event, _) = alice
        .expect_event(EventName::MessageCreate)
        .await
        .expect("alice receives her own message");
    let Event::MessageCreate(payload) = event else {
        panic!("expected MESSAGE_CREATE");
    };
    assert_eq!(payload.message.content, "ping");
}

#[tokio::test]
async fn typing_start_is_broadcast_excluding_the_typist() {
    let (addr, state) = spawn_server().await;
    let (alice, alice_token) = seed_user(&state, "alice", "a@x").await;
    let (_bob, bob_token) = seed_user(&state, "bob", "b@x").await;
    let channel = general_channel(&state).await;
    let url = format!("ws://{addr}/ws");

    let mut alice_conn = MockWsClient::connect_identified(&url, &alice_token)
        .await
        .expect("alice handshake");
    let mut bob_conn = MockWsClient::connect_identified(&url, &bob_token)
        .await
        .expect("bob handshake");

    let frame = Frame::with_payload(OpCode::TypingStart, &TypingStartCommand { channel_id: channel })
        .expect("frame");
    alice_conn.send_frame(&frame).await.expect("send");

    let (event, _) = bob_conn
        .expect_event(EventName::TypingStart)
        .await
        .expect("bob sees typing");
    let Event::TypingStart(payload) = event else {
        panic!("expected TYPING_START");
    };
    assert_eq!(payload.user_id, alice.id);
    assert_eq!(payload.channel_id, channel);

    // Alice must not see her own typing event: walk her socket up to the
    // MESSAGE_CREATE echo and fail on any TYPING_START along the way.
    send_message(&mut alice_conn, channel, "done typing").await;
    loop {
        let frame = alice_conn.recv_frame().await.expect("frame");
        if frame.op != OpCode::Dispatch {
            continue;
        }
        match frame.t {
            Some(EventName::TypingStart) => panic!("typist must not receive TYPING_START"),
            Some(EventName::MessageCreate) => {
                let Some(Event::MessageCreate(payload)) =
                    Event::from_frame(&frame).expect("decode")
                else {
                    panic!("expected MESSAGE_CREATE payload");
                };
                assert_eq!(payload.message.content, "done typing");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn whisper_reaches_target_and_echoes_to_sender_only_when_online() {
    let (addr, state) = spawn_server().await;
    let (_alice, alice_token) = seed_user(&state, "alice", "a@x").await;
    let (bob, bob_token) = seed_user(&state, "bob", "b@x").await;
    let url = format!("ws://{addr}/ws");

    let mut alice = MockWsClient::connect_identified(&url, &alice_token)
        .await
        .expect("alice handshake");
    let mut bob_conn = MockWsClient::connect_identified(&url, &bob_token)
        .await
        .expect("bob handshake");

    let frame = Frame::with_payload(
        OpCode::Whisper,
        &WhisperCommand { to_user_id: bob.id, content: "psst".to_owned() },
    )
    .expect("frame");
    alice.send_frame(&frame).await.expect("send");

    let (event, _) = bob_conn
        .expect_event(EventName::WhisperCreate)
        .await
        .expect("bob receives whisper");
    let Event::WhisperCreate(payload) = event else {
        panic!("expected WHISPER_CREATE");
    };
    assert_eq!(payload.content, "psst");
    assert_eq!(payload.from.username, "alice");

    let (event, _) = alice
        .expect_event(EventName::WhisperCreate)
        .await
        .expect("sender echo");
    let Event::WhisperCreate(payload) = event else {
        panic!("expected WHISPER_CREATE");
    };
    assert_eq!(payload.to_user_id, bob.id);
}

#[tokio::test]
async fn whisper_to_offline_user_is_not_found() {
    let (addr, state) = spawn_server().await;
    let (_alice, alice_token) = seed_user(&state, "alice", "a@x").await;
    let (bob, _bob_token) = seed_user(&state, "bob", "b@x").await;

    let mut alice = MockWsClient::connect_identified(&format!("ws://{addr}/ws"), &alice_token)
        .await
        .expect("handshake");
    let frame = Frame::with_payload(
        OpCode::Whisper,
        &WhisperCommand { to_user_id: bob.id, content: "anyone there?".to_owned() },
    )
    .expect("frame");
    alice.send_frame(&frame).await.expect("send");

    let reply = alice.recv_control_frame().await.expect("reply");
    assert_eq!(reply.op, OpCode::Error);
    let err: concord_protocol::ErrorPayload = reply.payload().expect("payload");
    assert_eq!(err.code, concord_protocol::ErrorCode::NotFound);
}

#[tokio::test]
async fn dispatch_sequence_numbers_increase_across_events() {
    let (addr, state) = spawn_server().await;
    let (_alice, token) = seed_user(&state, "alice", "a@x").await;
    let channel = general_channel(&state).await;

    let mut client = MockWsClient::connect_identified(&format!("ws://{addr}/ws"), &token)
        .await
        .expect("handshake");

    send_message(&mut client, channel, "one").await;
    let (_, first) = client
        .expect_event(EventName::MessageCreate)
        .await
        .expect("first");
    send_message(&mut client, channel, "two").await;
    let (_, second) = client
        .expect_event(EventName::MessageCreate)
        .await
        .expect("second");
    assert!(second > first, "expected {second} > {first}");
}
