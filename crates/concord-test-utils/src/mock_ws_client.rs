// mock_ws_client: a raw protocol client for driving a real server in tests.
//
// Speaks frames directly with no reconnect or state machine, so tests can
// assert on exact wire behavior (handshake ordering, error codes, sequence
// numbers).

use std::time::Duration;

use concord_protocol::{Event, EventName, Frame, Identify, OpCode};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connect and complete the full handshake: consume Hello, send
    /// Identify, and return once READY has been observed.
    pub async fn connect_identified(
        url: &str,
        token: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut client = Self::connect(url).await?;
        let hello = client.recv_frame().await?;
        assert_eq!(hello.op, OpCode::Hello, "server must lead with Hello");
        client.identify(token).await?;
        client.expect_event(EventName::Ready).await?;
        Ok(client)
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        let json = frame.encode()?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    pub async fn identify(&mut self, token: &str) -> Result<(), Box<dyn std::error::Error>> {
        let frame = Frame::with_payload(
            OpCode::Identify,
            &Identify { token: token.to_owned(), properties: None },
        )?;
        self.send_frame(&frame).await
    }

    /// The next protocol frame, skipping transport pings/pongs.
    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.read.next()).await?;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Frame::decode(&text)?),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// The next non-Dispatch frame (acks, errors, plumbing), skipping any
    /// dispatch traffic still queued from the handshake.
    pub async fn recv_control_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.op != OpCode::Dispatch {
                return Ok(frame);
            }
        }
    }

    /// Skip frames until the named dispatch event arrives, returning its
    /// decoded payload.
    pub async fn expect_event(
        &mut self,
        name: EventName,
    ) -> Result<(Event, u64), Box<dyn std::error::Error>> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.op != OpCode::Dispatch || frame.t != Some(name) {
                continue;
            }
            let seq = frame.s.ok_or("dispatch frame without sequence number")?;
            let event = Event::from_frame(&frame)?.ok_or("dispatch frame without event")?;
            return Ok((event, seq));
        }
    }

    /// The connection is expected to be closed by the server (or time out
    /// with nothing further to read).
    pub async fn expect_close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.read.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => return Ok(()),
                Err(_) => return Err("server did not close the connection".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
