//! Common test utilities for wsengine integration tests

#![allow(dead_code)]

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use wsengine::{CloseStatus, Connection, Frame, OpCode, Result, Session, WsError};

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// A mock WebSocket echo server for testing
///
/// Text and binary messages are echoed back. tungstenite answers pings and
/// close frames on its own; the connection task keeps reading after a close
/// so the reply is flushed. `start_closing` closes every connection right
/// after the handshake.
pub struct MockWsServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl MockWsServer {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// A server that sends a close frame as soon as a client connects
    pub async fn start_closing(code: u16, reason: &'static str) -> Self {
        Self::spawn(Some((code, reason))).await
    }

    async fn spawn(close_first: Option<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let shutdown = shutdown_clone.clone();
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, shutdown, close_first).await;
                                });
                            }
                            Err(e) => {
                                eprintln!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        break;
                    }
                }
            }
        });

        Self { addr, shutdown }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        shutdown: Arc<Notify>,
        close_first: Option<(u16, &'static str)>,
    ) {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::accept_async;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        let mut ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        if let Some((code, reason)) = close_first {
            let frame = CloseFrame {
                code: code.into(),
                reason: reason.into(),
            };
            if ws_stream.close(Some(frame)).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            if msg.is_text() || msg.is_binary() {
                                if ws_stream.send(msg).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// In-memory connection recording everything the session writes
#[derive(Default)]
pub struct RecordingConnection {
    frames: Mutex<Vec<Frame>>,
    disconnects: Mutex<Vec<CloseStatus>>,
    broken: AtomicBool,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn close_frames(&self) -> Vec<CloseStatus> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.opcode == OpCode::Close)
            .filter_map(|frame| CloseStatus::parse(&frame.payload).ok())
            .collect()
    }

    pub fn disconnects(&self) -> Vec<CloseStatus> {
        self.disconnects.lock().clone()
    }

    /// Make every further write fail with a transport error
    pub fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Connection for RecordingConnection {
    fn write_frame(&self, frame: Frame) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(WsError::Transport("broken pipe".into()));
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    fn disconnect(&self, status: &CloseStatus) {
        self.disconnects.lock().push(status.clone());
    }
}

/// In-memory peer echoing every frame back on its own thread
///
/// Pings come back as pongs. A close frame is echoed and ends the peer.
pub struct EchoPeer {
    outbound: Sender<Frame>,
    disconnects: Mutex<Vec<CloseStatus>>,
}

impl EchoPeer {
    pub fn spawn(session: &Session) -> Arc<Self> {
        let (outbound, inbound) = unbounded::<Frame>();
        let session = session.clone();

        thread::Builder::new()
            .name(format!("echo-peer-{}", session.id()))
            .spawn(move || {
                for frame in inbound.iter() {
                    match frame.opcode {
                        OpCode::Close => {
                            let _ = session.receive_frame(frame);
                            break;
                        }
                        OpCode::Ping => {
                            let _ = session.receive_frame(Frame::pong(frame.payload));
                        }
                        _ => {
                            let _ = session.receive_frame(frame);
                        }
                    }
                }
            })
            .unwrap();

        Arc::new(Self {
            outbound,
            disconnects: Mutex::new(Vec::new()),
        })
    }

    pub fn disconnects(&self) -> Vec<CloseStatus> {
        self.disconnects.lock().clone()
    }
}

impl Connection for EchoPeer {
    fn write_frame(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|e| WsError::Transport(format!("peer gone: {}", e)))
    }

    fn disconnect(&self, status: &CloseStatus) {
        self.disconnects.lock().push(status.clone());
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
