//! Streaming message bridge
//!
//! # Architecture
//!
//! ```text
//! I/O dispatch thread                         worker thread
//! ┌────────────────────┐  bounded queue   ┌──────────────────────┐
//! │ BridgeProducer     │ ──Chunk/EOM────> │ MessageInputStream   │
//! │ push(chunk, fin)   │  (blocks when    │ read(buf) / BufRead  │
//! │                    │   full)          │ MessageReader (UTF-8)│
//! └────────────────────┘                  └──────────────────────┘
//!            ▲                                       │
//!            │           completion (dropped at EOF or drop)
//!            └───────────────────────────────────────┘
//!
//!   CloseSignal ── disconnected when the session closes; releases a
//!                  producer blocked on a full queue and a reader blocked
//!                  on an empty one
//! ```
//!
//! The close signal is a channel that never carries a message. Dropping its
//! only sender disconnects every receiver at once, which is how one session
//! close reaches every bridge and the watchdog without a registry of waiters.

use crate::traits::{Result, WsError};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::io::{self, BufRead, Read};
use tracing::trace;

/// Broadcast fired once when a session closes
pub struct CloseSignal {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Receiver that disconnects when the signal fires
    pub fn subscribe(&self) -> Receiver<()> {
        self.rx.clone()
    }

    /// Fire the signal; later calls are no-ops
    pub fn fire(&self) {
        self.tx.lock().take();
    }
}

enum StreamItem {
    Chunk(Vec<u8>),
    EndOfMessage,
}

/// Create a bridge for one streamed message
///
/// `capacity` counts queue slots; the end-of-message marker takes one.
pub fn bridge(capacity: usize, closed: Receiver<()>) -> (BridgeProducer, MessageInputStream) {
    let (tx, rx) = bounded(capacity.max(1));
    let (done_tx, done_rx) = bounded(0);

    let producer = BridgeProducer {
        tx,
        closed: closed.clone(),
        completion: Completion { rx: done_rx },
    };
    let stream = MessageInputStream {
        rx,
        closed,
        current: Vec::new(),
        pos: 0,
        finished: false,
        completion: Some(done_tx),
    };
    (producer, stream)
}

/// Signals that the consumer of a bridge is done with it
#[derive(Clone)]
pub struct Completion {
    rx: Receiver<()>,
}

impl Completion {
    /// True once the consumer reached end-of-message or dropped its stream
    pub fn is_complete(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block until the consumer completes
    ///
    /// Returns false if `closed` fired first.
    pub fn wait(&self, closed: &Receiver<()>) -> bool {
        if self.is_complete() {
            return true;
        }
        select! {
            recv(self.rx) -> _ => true,
            recv(closed) -> _ => self.is_complete(),
        }
    }
}

/// Push side of a bridge, held by the dispatch path
pub struct BridgeProducer {
    tx: Sender<StreamItem>,
    closed: Receiver<()>,
    completion: Completion,
}

impl BridgeProducer {
    /// Enqueue a chunk, then an end-of-message marker when `fin` is set
    ///
    /// Blocks while the queue is full. Fails only when the session closes
    /// while blocked. A consumer that already went away silently discards
    /// the rest of the message.
    pub fn push(&self, chunk: Vec<u8>, fin: bool) -> Result<()> {
        if !chunk.is_empty() {
            self.send(StreamItem::Chunk(chunk))?;
        }
        if fin {
            self.send(StreamItem::EndOfMessage)?;
        }
        Ok(())
    }

    fn send(&self, item: StreamItem) -> Result<()> {
        let item = match self.tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Disconnected(_)) => {
                trace!("Stream consumer gone, discarding chunk");
                return Ok(());
            }
            Err(TrySendError::Full(item)) => item,
        };

        select! {
            send(self.tx, item) -> res => {
                if res.is_err() {
                    trace!("Stream consumer gone, discarding chunk");
                }
                Ok(())
            }
            recv(self.closed) -> _ => Err(WsError::InvalidState(
                "session closed while streaming a message".into(),
            )),
        }
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

fn aborted() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "session closed before end of message",
    )
}

/// Pull side of a bridge: the bytes of one message
///
/// `read` returns `Ok(0)` at end of message, and keeps returning it. If the
/// session closes mid-message, queued data is still returned, after which
/// reads fail with `ErrorKind::ConnectionAborted`.
pub struct MessageInputStream {
    rx: Receiver<StreamItem>,
    closed: Receiver<()>,
    current: Vec<u8>,
    pos: usize,
    finished: bool,
    completion: Option<Sender<()>>,
}

impl MessageInputStream {
    /// Whether end-of-message was reached
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Make sure unread bytes are buffered; false at end of message
    fn fill(&mut self) -> io::Result<bool> {
        loop {
            if self.pos < self.current.len() {
                return Ok(true);
            }
            if self.finished {
                return Ok(false);
            }

            let item = match self.rx.try_recv() {
                Ok(item) => item,
                Err(TryRecvError::Disconnected) => return Err(aborted()),
                Err(TryRecvError::Empty) => {
                    let next = select! {
                        recv(self.rx) -> item => item.ok(),
                        recv(self.closed) -> _ => self.rx.try_recv().ok(),
                    };
                    next.ok_or_else(aborted)?
                }
            };

            match item {
                StreamItem::Chunk(data) => {
                    self.current = data;
                    self.pos = 0;
                }
                StreamItem::EndOfMessage => {
                    self.finished = true;
                    self.current = Vec::new();
                    self.pos = 0;
                    self.completion.take();
                }
            }
        }
    }
}

impl Read for MessageInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.fill()? {
            return Ok(0);
        }
        let available = &self.current[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl BufRead for MessageInputStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if !self.fill()? {
            return Ok(&[]);
        }
        Ok(&self.current[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.current.len());
    }
}

/// Character view of a streamed text message
///
/// Decodes UTF-8 incrementally, so a character split across two frames is
/// returned whole. Invalid or truncated UTF-8 fails with
/// `ErrorKind::InvalidData`.
pub struct MessageReader {
    inner: MessageInputStream,
    pending: Vec<u8>,
    text: String,
    text_pos: usize,
}

impl MessageReader {
    pub fn new(inner: MessageInputStream) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            text: String::new(),
            text_pos: 0,
        }
    }

    /// Decode the next run of characters; false at end of message
    fn fill(&mut self) -> io::Result<bool> {
        while self.text_pos >= self.text.len() {
            let chunk = self.inner.fill_buf()?;
            if chunk.is_empty() {
                if !self.pending.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "message ends inside a UTF-8 sequence",
                    ));
                }
                return Ok(false);
            }
            let consumed = chunk.len();
            self.pending.extend_from_slice(chunk);
            self.inner.consume(consumed);

            let valid = match std::str::from_utf8(&self.pending) {
                Ok(_) => self.pending.len(),
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text message is not valid UTF-8",
                    ))
                }
            };

            let rest = self.pending.split_off(valid);
            let decoded = std::mem::replace(&mut self.pending, rest);
            // The prefix was validated above
            self.text = String::from_utf8(decoded)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.text_pos = 0;
        }
        Ok(true)
    }

    fn ensure_char_boundary(&self) -> io::Result<()> {
        if self.text.is_char_boundary(self.text_pos) {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "a byte read stopped inside a character",
        ))
    }

    /// Read up to `buf.len()` characters; 0 at end of message
    pub fn read_chars(&mut self, buf: &mut [char]) -> io::Result<usize> {
        self.ensure_char_boundary()?;
        let mut count = 0;
        while count < buf.len() {
            if !self.fill()? {
                break;
            }
            let mut chars = self.text[self.text_pos..].chars();
            while count < buf.len() {
                match chars.next() {
                    Some(c) => {
                        buf[count] = c;
                        count += 1;
                        self.text_pos += c.len_utf8();
                    }
                    None => break,
                }
            }
            // Return what is available rather than blocking for more
            if count > 0 {
                break;
            }
        }
        Ok(count)
    }

    /// Append the rest of the message to `out`, returning bytes appended
    pub fn read_to_string(&mut self, out: &mut String) -> io::Result<usize> {
        self.ensure_char_boundary()?;
        let start = out.len();
        while self.fill()? {
            out.push_str(&self.text[self.text_pos..]);
            self.text_pos = self.text.len();
        }
        Ok(out.len() - start)
    }

    pub fn into_inner(self) -> MessageInputStream {
        self.inner
    }
}

/// UTF-8 bytes of the message, validated
///
/// A byte read may stop inside a character; `read_chars` and
/// `read_to_string` refuse to resume from there.
impl Read for MessageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.fill()? {
            return Ok(0);
        }
        let available = &self.text.as_bytes()[self.text_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.text_pos += n;
        Ok(n)
    }
}
