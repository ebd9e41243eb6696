mod common;

use common::{PORT, config, text, worker};
use nexgate::library::{
    chunk::pool::{PrivateChunkPool, SharedChunkPool},
    session::{Protocol, Session},
    socket_data::{MessageKind, SocketDataUnit},
};
use proptest::prelude::*;
use std::time::Duration;

const CHUNK: usize = 256;
const MAX_CHUNKS: usize = 32;

fn request(body: &[u8]) -> Vec<u8> {
    let mut raw = format!("POST /upload HTTP/1.1\r\nHost: gw\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    raw.extend_from_slice(body);
    raw
}

fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

/// Splits `raw` at the sorted, deduplicated `cuts`.
fn fragments(raw: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % raw.len()).filter(|c| *c > 0).collect();
    points.sort_unstable();
    points.dedup();
    let mut out = Vec::new();
    let mut from = 0;
    for point in points {
        out.push(raw[from..point].to_vec());
        from = point;
    }
    out.push(raw[from..].to_vec());
    out
}

fn unit() -> SocketDataUnit {
    let session = Session {
        salt: 1,
        slot: 0,
        worker: 0,
    };
    SocketDataUnit::new(3, PORT, session, 0, Protocol::Http1)
}

proptest! {
    #[test]
    fn fragmented_request_reassembles_byte_identical(
        chunks in 1usize..6,
        extra in 0usize..150,
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let shared = SharedChunkPool::new(256, CHUNK);
        let mut pool = PrivateChunkPool::new(shared, 8, 16, Duration::from_millis(10));
        let body = body_of(chunks * pool.arena().payload_size() + extra);
        let raw = request(&body);
        let mut unit = unit();
        let mut message = None;
        for piece in fragments(&raw, &cuts) {
            prop_assert!(message.is_none(), "message completed before the last fragment");
            unit.push_bytes(&mut pool, &piece, MAX_CHUNKS).unwrap();
            if let Some(found) = unit.poll_message(pool.arena(), MAX_CHUNKS).unwrap() {
                message = Some(found);
            }
        }
        let message = message.expect("complete request");
        prop_assert_eq!(message.len, raw.len());
        let MessageKind::Http(head) = &message.kind else {
            panic!("expected an HTTP message");
        };
        prop_assert_eq!(head.content_length, body.len());
        let chain = unit.take_message(&mut pool, message.len).unwrap();
        prop_assert_eq!(chain.read_payload(pool.arena()), raw);
        pool.release(chain);
        prop_assert_eq!(unit.filled(), 0);
    }
}

#[test]
fn pipelined_bytes_stay_in_the_unit() {
    let shared = SharedChunkPool::new(64, CHUNK);
    let mut pool = PrivateChunkPool::new(shared, 8, 16, Duration::from_millis(10));
    let first = request(b"one");
    let second = request(b"second");
    let mut both = first.clone();
    both.extend_from_slice(&second);
    let mut unit = unit();
    unit.push_bytes(&mut pool, &both, MAX_CHUNKS).unwrap();

    let message = unit.poll_message(pool.arena(), MAX_CHUNKS).unwrap().unwrap();
    assert_eq!(message.len, first.len());
    let chain = unit.take_message(&mut pool, message.len).unwrap();
    assert_eq!(chain.read_payload(pool.arena()), first);
    pool.release(chain);

    let message = unit.poll_message(pool.arena(), MAX_CHUNKS).unwrap().unwrap();
    assert_eq!(message.len, second.len());
    let chain = unit.take_message(&mut pool, message.len).unwrap();
    assert_eq!(chain.read_payload(pool.arena()), second);
    pool.release(chain);
}

#[test]
fn oversized_declared_length_is_rejected() {
    let shared = SharedChunkPool::new(64, CHUNK);
    let mut pool = PrivateChunkPool::new(shared, 8, 16, Duration::from_millis(10));
    let mut unit = unit();
    let head = b"POST /x HTTP/1.1\r\nContent-Length: 999999\r\n\r\n";
    unit.push_bytes(&mut pool, head, 4).unwrap();
    assert!(unit.poll_message(pool.arena(), 4).is_err());
}

fn echo_through_worker(body_len: usize, fragment: usize) -> Vec<u8> {
    let (_gateway, mut worker) = worker(config());
    let fd = worker.driver_mut().connect(PORT);
    let body = body_of(body_len);
    let mut raw = format!("POST /echo HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    raw.extend_from_slice(&body);
    worker.driver_mut().set_fragment(fd, fragment);
    worker.driver_mut().feed(fd, &raw);
    let turns = match fragment {
        0 => 64,
        n => 64 + 2 * raw.len().div_ceil(n),
    };
    let out = common::output_after(&mut worker, fd, turns);
    let text = text(&out);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got {:?}", text);
    let split = text.find("\r\n\r\n").expect("end of head") + 4;
    out[split..].to_vec()
}

#[test]
fn worker_reassembles_fragmented_echo() {
    for (body_len, fragment) in [(8, 1), (700, 7), (1500, 208), (1500, 1000), (3000, 0)] {
        assert_eq!(echo_through_worker(body_len, fragment), body_of(body_len), "body {} fragment {}", body_len, fragment);
    }
}

#[test]
fn driver_never_sees_two_receives() {
    // The scripted driver asserts on a second armed receive per fd.
    let (_gateway, mut worker) = worker(config());
    let fd = worker.driver_mut().connect(PORT);
    worker.driver_mut().set_fragment(fd, 3);
    worker
        .driver_mut()
        .feed(fd, b"GET /pong HTTP/1.1\r\n\r\nGET /pong HTTP/1.1\r\n\r\n");
    let out = common::output_after(&mut worker, fd, 100);
    assert_eq!(text(&out).matches("Pong!").count(), 2);
    assert!(!worker.driver().is_closed(fd));
}
