//! tokio-tungstenite transport for sessions
//!
//! # Architecture
//!
//! ```text
//!             ┌───────────────┐  bounded mpsc   ┌─────────────────────┐
//! socket ───> │ reader task   │ ──────────────> │ ws-dispatch-{id}    │
//!             │ (tokio spawn) │  Frame/Failed   │ OS thread           │
//!             └───────────────┘                 │ Session::receive_*  │
//!                    ▲ Notify                   └─────────┬───────────┘
//!                    │                                    │ handlers send
//!             ┌──────┴────────┐  unbounded mpsc           ▼
//! socket <─── │ writer task   │ <──────────── TungsteniteConnection
//!             │ (tokio spawn) │   Frame/Disconnect
//!             └───────────────┘
//! ```
//!
//! tungstenite reassembles fragmented messages and answers pings and close
//! frames itself, so the session sees whole messages and runs with
//! `auto_pong` off. Outgoing fragments are written as raw frames. A write
//! rejected because tungstenite already answered the peer's close is only
//! logged, the session finishes when the reader delivers that close.

use crate::core::frame::{CloseCode, CloseStatus, Frame, OpCode};
use crate::core::session::{Handshake, Session};
use crate::traits::{Connection, Result, WsError};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::client::Response;
use tokio_tungstenite::tungstenite::http::header::{
    SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode as WireOpCode};
use tokio_tungstenite::tungstenite::protocol::frame::{CloseFrame, Frame as WireFrame};
use tokio_tungstenite::tungstenite::error::{Error as WsStreamError, ProtocolError};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

enum Inbound {
    Frame(Frame),
    Failed(String),
}

enum Outbound {
    Frame(Frame),
    Disconnect,
}

/// `Connection` backed by the writer task of one WebSocket stream
pub struct TungsteniteConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl Connection for TungsteniteConnection {
    fn write_frame(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| WsError::ChannelSend("connection writer has stopped".into()))
    }

    fn disconnect(&self, status: &CloseStatus) {
        debug!("Disconnecting transport after close {}", status);
        let _ = self.outbound.send(Outbound::Disconnect);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

/// Negotiated sub-protocol and extensions from an upgrade response
pub fn handshake_from_response(response: &Response) -> Handshake {
    let headers = response.headers();
    let sub_protocol = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let extensions = headers
        .get_all(SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|ext| ext.trim().to_string())
        .filter(|ext| !ext.is_empty())
        .collect();

    Handshake {
        sub_protocol,
        extensions,
        local_addr: None,
        remote_addr: None,
    }
}

/// Socket addresses of a client stream, when it is plain TCP
pub fn tcp_addrs(
    stream: &WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> (Option<SocketAddr>, Option<SocketAddr>) {
    match stream.get_ref() {
        MaybeTlsStream::Plain(tcp) => (tcp.local_addr().ok(), tcp.peer_addr().ok()),
        _ => (None, None),
    }
}

/// Drive `session` over an established WebSocket stream
///
/// Opens the session, then starts the reader and writer tasks on the
/// current tokio runtime and the dispatch thread. Must be called from
/// within a runtime.
pub fn run_session<S>(
    session: Session,
    stream: WebSocketStream<S>,
    dispatch_queue_capacity: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = stream.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(dispatch_queue_capacity.max(1));
    let shutdown = Arc::new(Notify::new());

    let connection = Arc::new(TungsteniteConnection {
        outbound: outbound_tx,
        local_addr: session.local_addr(),
        remote_addr: session.remote_addr(),
    });

    tokio::spawn(write_loop(write, outbound_rx, session.clone(), Arc::clone(&shutdown)));
    session.open(connection)?;

    let dispatch_session = session.clone();
    thread::Builder::new()
        .name(format!("ws-dispatch-{}", session.id()))
        .spawn(move || dispatch_loop(dispatch_session, inbound_rx))
        .map_err(|e| {
            let e = WsError::Configuration(format!("failed to spawn dispatch thread: {}", e));
            session.transport_failed(e.to_string());
            e
        })?;

    tokio::spawn(read_loop(read, inbound_tx, shutdown, session.id().as_u64()));
    Ok(())
}

async fn read_loop<R>(
    mut read: R,
    inbound: mpsc::Sender<Inbound>,
    shutdown: Arc<Notify>,
    id: u64,
) where
    R: futures::Stream<Item = std::result::Result<Message, WsStreamError>> + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = shutdown.notified() => {
                trace!(session = id, "Reader stopping on shutdown");
                return;
            }
            item = read.next() => item,
        };

        let inbound_item = match item {
            Some(Ok(message)) => match frame_from_message(message) {
                Some(frame) => Inbound::Frame(frame),
                None => continue,
            },
            Some(Err(e)) => Inbound::Failed(e.to_string()),
            None => Inbound::Failed("connection closed without a close frame".into()),
        };
        let last = matches!(inbound_item, Inbound::Failed(_));

        // Blocks while the dispatch thread is behind
        if inbound.send(inbound_item).await.is_err() || last {
            return;
        }
    }
}

async fn write_loop<W>(
    mut write: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    session: Session,
    shutdown: Arc<Notify>,
) where
    W: futures::Sink<Message, Error = WsStreamError> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let closing = frame.opcode == OpCode::Close;
                match write.send(message_from_frame(frame)).await {
                    Ok(()) => {}
                    // The reader delivers the peer's close
                    Err(e) if closing || after_close(&e) => {
                        debug!(session = %session.id(), "Close frame not written: {}", e);
                    }
                    Err(e) => {
                        warn!(session = %session.id(), "WebSocket write failed: {}", e);
                        session.transport_failed(e.to_string());
                        break;
                    }
                }
            }
            Outbound::Disconnect => {
                if let Err(e) = write.close().await {
                    debug!(session = %session.id(), "Error closing WebSocket: {}", e);
                }
                break;
            }
        }
    }
    shutdown.notify_one();
    debug!(session = %session.id(), "Writer stopped");
}

fn dispatch_loop(session: Session, mut inbound: mpsc::Receiver<Inbound>) {
    debug!(session = %session.id(), "Dispatch thread started");
    while let Some(item) = inbound.blocking_recv() {
        match item {
            Inbound::Frame(frame) => {
                if let Err(e) = session.receive_frame(frame) {
                    debug!(session = %session.id(), "Frame rejected: {}", e);
                }
            }
            Inbound::Failed(cause) => {
                session.transport_failed(cause);
            }
        }
        if session.state().is_terminal() {
            break;
        }
    }
    debug!(session = %session.id(), "Dispatch thread stopped");
}

/// Errors tungstenite returns once it has taken part in a close handshake
fn after_close(error: &WsStreamError) -> bool {
    matches!(
        error,
        WsStreamError::AlreadyClosed
            | WsStreamError::ConnectionClosed
            | WsStreamError::Protocol(ProtocolError::SendAfterClosing)
    )
}

fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::text(text)),
        Message::Binary(data) => Some(Frame::binary(data)),
        Message::Ping(data) => Some(Frame::ping(data)),
        Message::Pong(data) => Some(Frame::pong(data)),
        Message::Close(Some(close)) => {
            let code = CloseCode::from(u16::from(close.code));
            let status = CloseStatus::new(code, close.reason.into_owned());
            Some(Frame::close(&status))
        }
        Message::Close(None) => Some(Frame::new(OpCode::Close, Vec::new(), true)),
        // Only produced when writing raw frames
        Message::Frame(_) => None,
    }
}

fn message_from_frame(frame: Frame) -> Message {
    let Frame {
        opcode,
        payload,
        fin,
    } = frame;

    match (opcode, fin) {
        (OpCode::Ping, _) => Message::Ping(payload),
        (OpCode::Pong, _) => Message::Pong(payload),
        (OpCode::Close, _) => match CloseStatus::parse(&payload) {
            Ok(status) if status.code != CloseCode::NoStatus => Message::Close(Some(CloseFrame {
                code: u16::from(status.code).into(),
                reason: status.reason.into(),
            })),
            _ => Message::Close(None),
        },
        (OpCode::Binary, true) => Message::Binary(payload),
        (OpCode::Text, true) => match String::from_utf8(payload) {
            Ok(text) => Message::Text(text),
            Err(e) => raw(OpCode::Text, e.into_bytes(), true),
        },
        (opcode, fin) => raw(opcode, payload, fin),
    }
}

fn raw(opcode: OpCode, payload: Vec<u8>, fin: bool) -> Message {
    let data = match opcode {
        OpCode::Text => Data::Text,
        OpCode::Binary => Data::Binary,
        _ => Data::Continue,
    };
    Message::Frame(WireFrame::message(payload, WireOpCode::Data(data), fin))
}
