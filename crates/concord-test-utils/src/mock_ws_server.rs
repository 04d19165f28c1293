// mock_ws_server: a scripted Concord server for testing client-side logic.
//
// Binds port 0 so every test gets an isolated instance. Each connection is
// handled in its own task: Hello goes out immediately, Identify is judged
// against the configured behavior, and accepted sessions get a minimal
// READY. Inbound frames are forwarded to the test through an inbox channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use concord_protocol::events::{Event, ReadyPayload};
use concord_protocol::{
    Frame, Hello, Identify, InvalidSession, OpCode, Status, User, HEARTBEAT_INTERVAL_MS,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// How a mock server judges Identify tokens.
#[derive(Debug, Clone)]
pub enum MockServerBehavior {
    /// Every token is accepted.
    AcceptAll,
    /// Every token is rejected with InvalidSession.
    RejectAll,
    /// One specific token is rejected; everything else is accepted. Used to
    /// drive the stale-token → re-auth path.
    RejectToken(String),
}

impl MockServerBehavior {
    fn accepts(&self, token: &str) -> bool {
        match self {
            MockServerBehavior::AcceptAll => true,
            MockServerBehavior::RejectAll => false,
            MockServerBehavior::RejectToken(stale) => token != stale,
        }
    }
}

pub struct MockWsServer {
    addr: SocketAddr,
    inbox: Option<mpsc::UnboundedReceiver<Frame>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockWsServer {
    pub async fn start(behavior: MockServerBehavior) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let seq = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let behavior = behavior.clone();
                let inbox_tx = inbox_tx.clone();
                let seq = Arc::clone(&seq);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, behavior, inbox_tx, seq).await;
                });
            }
        });

        Ok(Self { addr, inbox: Some(inbox_rx), _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Every frame any connection sends, in receive order. Callable once.
    pub fn take_inbox(&mut self) -> mpsc::UnboundedReceiver<Frame> {
        self.inbox.take().expect("inbox already taken")
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    behavior: MockServerBehavior,
    inbox_tx: mpsc::UnboundedSender<Frame>,
    seq: Arc<AtomicU64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let hello = Frame::with_payload(
        OpCode::Hello,
        &Hello { heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS },
    )?;
    write.send(Message::Text(hello.encode()?.into())).await?;

    let mut authenticated = false;
    while let Some(msg) = read.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Ping(data) => {
                write.send(Message::Pong(data)).await?;
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = Frame::decode(&text)?;
        let _ = inbox_tx.send(frame.clone());

        match frame.op {
            OpCode::Identify if !authenticated => {
                let identify: Identify = frame.payload()?;
                if behavior.accepts(&identify.token) {
                    authenticated = true;
                    let ready = Event::Ready(ReadyPayload {
                        session_id: uuid::Uuid::new_v4().to_string(),
                        user: mock_user(),
                        servers: vec![],
                    });
                    let next = seq.fetch_add(1, Ordering::SeqCst) + 1;
                    write
                        .send(Message::Text(ready.to_frame(next)?.encode()?.into()))
                        .await?;
                } else {
                    let frame = Frame::with_payload(
                        OpCode::InvalidSession,
                        &InvalidSession { reason: "unknown or expired token".to_owned() },
                    )?;
                    write.send(Message::Text(frame.encode()?.into())).await?;
                    write.send(Message::Close(None)).await?;
                    break;
                }
            }
            OpCode::Heartbeat => {
                let ack = Frame::bare(OpCode::HeartbeatAck);
                write.send(Message::Text(ack.encode()?.into())).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn mock_user() -> User {
    User {
        id: uuid::Uuid::new_v4(),
        username: "mock".to_owned(),
        display_name: "Mock".to_owned(),
        email: "mock@example.test".to_owned(),
        status: Status::Online,
        status_text: String::new(),
    }
}
