//! Integration tests for streamed message delivery
//!
//! Streaming handlers run on executor threads and read the message while
//! the dispatch side is still feeding fragments into the bridge.

mod common;

use common::{wait_until, RecordingConnection};
use crossbeam_channel::{bounded, unbounded};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use wsengine::*;

const WAIT: Duration = Duration::from_secs(2);

fn quiet(capacity: usize) -> SessionConfig {
    SessionConfig::default()
        .with_idle_timeout(None)
        .with_stream_queue_capacity(capacity)
}

fn fragment(first: bool, payload: Vec<u8>, fin: bool) -> Frame {
    let opcode = if first { OpCode::Binary } else { OpCode::Continuation };
    Frame::new(opcode, payload, fin)
}

#[test]
fn test_bridge_backpressure_blocks_dispatch_until_read() {
    verbose_println!("Testing bridge backpressure...");

    const CAPACITY: usize = 2;
    const FRAGMENTS: usize = 6;

    let (gate_tx, gate_rx) = bounded::<()>(1);
    let (body_tx, body_rx) = unbounded::<Vec<u8>>();
    let endpoint = Endpoint::builder()
        .on_binary_stream(move |_, mut stream| {
            let _ = gate_rx.recv();
            let mut body = Vec::new();
            stream
                .read_to_end(&mut body)
                .map_err(|e| WsError::Handler(e.to_string()))?;
            let _ = body_tx.send(body);
            Ok(())
        })
        .build()
        .unwrap();
    let session = Session::builder(endpoint)
        .config(quiet(CAPACITY))
        .build()
        .unwrap();
    session.open(RecordingConnection::new()).unwrap();

    let fed = Arc::new(AtomicUsize::new(0));
    let feeder = {
        let session = session.clone();
        let fed = fed.clone();
        thread::spawn(move || {
            for i in 0..FRAGMENTS {
                let frame = fragment(i == 0, vec![i as u8; 4], i == FRAGMENTS - 1);
                session.receive_frame(frame).unwrap();
                fed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    assert!(wait_until(WAIT, || fed.load(Ordering::SeqCst) == CAPACITY));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fed.load(Ordering::SeqCst), CAPACITY, "producer ran past the queue bound");
    verbose_println!("  producer held at {} fragments", CAPACITY);

    gate_tx.send(()).unwrap();
    feeder.join().unwrap();

    let body = body_rx.recv_timeout(WAIT).unwrap();
    let expected: Vec<u8> = (0..FRAGMENTS).flat_map(|i| vec![i as u8; 4]).collect();
    assert_eq!(body, expected);
    assert_eq!(session.metrics().messages_received, 1);
}

#[test]
fn test_blocked_reader_released_on_abnormal_close() {
    let (started_tx, started_rx) = bounded::<()>(1);
    let (outcome_tx, outcome_rx) = bounded::<(ErrorKind, usize)>(1);
    let endpoint = Endpoint::builder()
        .on_binary_stream(move |_, mut stream| {
            let mut received = 0;
            let mut buf = [0u8; 64];
            let _ = started_tx.send(());
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) => received += n,
                    Err(e) => {
                        let _ = outcome_tx.send((e.kind(), received));
                        return Err(WsError::Handler(e.to_string()));
                    }
                }
            }
        })
        .build()
        .unwrap();
    let session = Session::builder(endpoint).config(quiet(4)).build().unwrap();
    session.open(RecordingConnection::new()).unwrap();

    session.receive_frame(fragment(true, vec![1; 10], false)).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let started = Instant::now();
    session.transport_failed("connection reset by peer");

    let (kind, received) = outcome_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(kind, ErrorKind::ConnectionAborted);
    assert_eq!(received, 10);
    assert!(started.elapsed() < WAIT);
    assert_eq!(session.state(), SessionState::AbnormalClosed);
}

#[test]
fn test_text_stream_reassembles_split_characters() {
    let (text_tx, text_rx) = unbounded::<String>();
    let endpoint = Endpoint::builder()
        .on_text_stream(move |_, mut reader| {
            let mut text = String::new();
            reader
                .read_to_string(&mut text)
                .map_err(|e| WsError::Handler(e.to_string()))?;
            let _ = text_tx.send(text);
            Ok(())
        })
        .build()
        .unwrap();
    let session = Session::builder(endpoint).config(quiet(8)).build().unwrap();
    session.open(RecordingConnection::new()).unwrap();

    let bytes = "héllo wörld".as_bytes().to_vec();
    // split inside the two-byte 'é'
    let (first, rest) = bytes.split_at(2);
    let (middle, last) = rest.split_at(6);
    session.receive_frame(Frame::new(OpCode::Text, first.to_vec(), false)).unwrap();
    session.receive_frame(Frame::new(OpCode::Continuation, middle.to_vec(), false)).unwrap();
    session.receive_frame(Frame::new(OpCode::Continuation, last.to_vec(), true)).unwrap();

    assert_eq!(text_rx.recv_timeout(WAIT).unwrap(), "héllo wörld");
}

#[test]
fn test_streamed_messages_consumed_in_order() {
    let (bodies_tx, bodies_rx) = unbounded::<Vec<u8>>();
    let endpoint = Endpoint::builder()
        .on_binary_stream(move |_, mut stream| {
            let mut body = Vec::new();
            stream
                .read_to_end(&mut body)
                .map_err(|e| WsError::Handler(e.to_string()))?;
            let _ = bodies_tx.send(body);
            Ok(())
        })
        .build()
        .unwrap();
    let session = Session::builder(endpoint).config(quiet(2)).build().unwrap();
    session.open(RecordingConnection::new()).unwrap();

    for message in 0..5u8 {
        session.receive_frame(fragment(true, vec![message; 3], false)).unwrap();
        session.receive_frame(fragment(false, vec![message; 3], true)).unwrap();
    }

    for message in 0..5u8 {
        assert_eq!(bodies_rx.recv_timeout(WAIT).unwrap(), vec![message; 6]);
    }
}
