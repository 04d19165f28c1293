//! RequestMessages: addressed replies, paging, and the has_more hint.

use concord_protocol::{
    Event, EventName, Frame, OpCode, RequestMessagesCommand, SendMessageCommand,
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

async fn seed_user(state: &AppState, username: &str, email: &str) -> String {
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
    token
}

#[tokio::test]
async fn history_is_delivered_to_the_requesting_user_only() {
    let (addr, state) = spawn_server().await;
    let alice_token = seed_user(&state, "alice", "a@x").await;
    let bob_token = seed_user(&state, "bob", "b@x").await;
    let url = format!("ws://{addr}/ws");

    let mut alice = MockWsClient::connect_identified(&url, &alice_token)
        .await
        .expect("alice handshake");
    let mut bob = MockWsClient::connect_identified(&url, &bob_token)
        .await
        .expect("bob handshake");

    let channel = {
        let store = state.store.lock().await;
        let default = store
            .server_by_name(server::http::DEFAULT_SERVER_NAME)
            .expect("query")
            .expect("default server");
        store
            .default_channel(default.id)
            .expect("query")
            .expect("general")
            .id
    };

    // Put three messages on the wire first.
    for content in ["m1", "m2", "m3"] {
        let frame = Frame::with_payload(
            OpCode::SendMessage,
            &SendMessageCommand {
                channel_id: channel,
                content: content.to_owned(),
                nonce: None,
                reply_to_id: None,
            },
        )
        .expect("frame");
        alice.send_frame(&frame).await.expect("send");
        alice
            .expect_event(EventName::MessageCreate)
            .await
            .expect("echo");
    }

    let request = Frame::with_payload(
        OpCode::RequestMessages,
        &RequestMessagesCommand { channel_id: channel, before: None, limit: Some(2) },
    )
    .expect("frame");
    alice.send_frame(&request).await.expect("send");

    let (event, _) = alice
        .expect_event(EventName::MessagesHistory)
        .await
        .expect("history");
    let Event::MessagesHistory(history) = event else {
        panic!("expected MESSAGES_HISTORY");
    };
    assert_eq!(history.channel_id, channel);
    assert_eq!(
        history
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>(),
        vec!["m2", "m3"],
        "oldest-first page of the most recent messages"
    );
    assert!(history.has_more);
    assert_eq!(history.authors.len(), 1);
    assert_eq!(history.authors[0].username, "alice");

    // Bob never sees the history dispatch: probe his socket with a fresh
    // message and require that to be the next dispatch after the catchup he
    // already had.
    let probe = Frame::with_payload(
        OpCode::SendMessage,
        &SendMessageCommand {
            channel_id: channel,
            content: "probe".to_owned(),
            nonce: None,
            reply_to_id: None,
        },
    )
    .expect("frame");
    bob.send_frame(&probe).await.expect("send");
    loop {
        let frame = bob.recv_frame().await.expect("frame");
        if frame.op != OpCode::Dispatch {
            continue;
        }
        match frame.t {
            Some(EventName::MessagesHistory) => {
                panic!("history must not be broadcast to other users")
            }
            Some(EventName::MessageCreate) => {
                let Some(Event::MessageCreate(payload)) =
                    Event::from_frame(&frame).expect("decode")
                else {
                    panic!("expected MESSAGE_CREATE payload");
                };
                if payload.message.content == "probe" {
                    break;
                }
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn paging_with_before_walks_backwards() {
    let (addr, state) = spawn_server().await;
    let token = seed_user(&state, "alice", "a@x").await;
    let mut client = MockWsClient::connect_identified(&format!("ws://{addr}/ws"), &token)
        .await
        .expect("handshake");

    let channel = {
        let store = state.store.lock().await;
        let default = store
            .server_by_name(server::http::DEFAULT_SERVER_NAME)
            .expect("query")
            .expect("default server");
        store
            .default_channel(default.id)
            .expect("query")
            .expect("general")
            .id
    };

    for i in 0..5 {
        let frame = Frame::with_payload(
            OpCode::SendMessage,
            &SendMessageCommand {
                channel_id: channel,
                content: format!("m{i}"),
                nonce: None,
                reply_to_id: None,
            },
        )
        .expect("frame");
        client.send_frame(&frame).await.expect("send");
        client
            .expect_event(EventName::MessageCreate)
            .await
            .expect("echo");
    }

    let request = |before| {
        Frame::with_payload(
            OpCode::RequestMessages,
            &RequestMessagesCommand { channel_id: channel, before, limit: Some(2) },
        )
        .expect("frame")
    };

    client.send_frame(&request(None)).await.expect("send");
    let (event, _) = client
        .expect_event(EventName::MessagesHistory)
        .await
        .expect("first page");
    let Event::MessagesHistory(page) = event else {
        panic!("expected MESSAGES_HISTORY");
    };
    assert_eq!(
        page.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["m3", "m4"]
    );

    client
        .send_frame(&request(Some(page.messages[0].id)))
        .await
        .expect("send");
    let (event, _) = client
        .expect_event(EventName::MessagesHistory)
        .await
        .expect("second page");
    let Event::MessagesHistory(page) = event else {
        panic!("expected MESSAGES_HISTORY");
    };
    assert_eq!(
        page.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["m1", "m2"]
    );
    assert!(page.has_more);
}
