mod common;

use common::{PORT, config, spin, turn_until, worker};
use nexgate::library::{
    channel::{Channel, Signal, Wake},
    chunk::{
        ChunkChain,
        pool::{PrivateChunkPool, SharedChunkPool},
    },
    config::GatewayConfig,
    protocol::http::{HttpParser, Method},
    worker::overflow::OverflowQueue,
};
use proptest::prelude::*;
use std::{sync::Arc, time::Duration};

fn chains(pool: &mut PrivateChunkPool, n: usize) -> Vec<ChunkChain> {
    (0..n).map(|_| pool.acquire(1).expect("chunk")).collect()
}

proptest! {
    /// A capacity-1 channel that refuses `fails` retries before the consumer
    /// starts popping. Every chain arrives once, in push order.
    #[test]
    fn overflowed_chains_arrive_once_in_order(n in 2usize..24, fails in 0usize..6) {
        let shared = SharedChunkPool::new(64, 512);
        let mut pool = PrivateChunkPool::new(shared, 0, 64, Duration::from_millis(10));
        let channel = Channel::new(1, Signal::new() as Arc<dyn Wake>);
        let mut queue = OverflowQueue::new(1);

        let sent = chains(&mut pool, n);
        let order: Vec<u32> = sent.iter().filter_map(ChunkChain::head_index).collect();
        let mut direct = 0;
        for chain in sent {
            if queue.push_or_queue(0, &channel, chain) {
                direct += 1;
            }
        }
        prop_assert_eq!(direct, 1);
        prop_assert_eq!(queue.len(), n - 1);

        for _ in 0..fails {
            prop_assert_eq!(queue.flush(|_| Some(&channel)), 0);
        }
        prop_assert_eq!(queue.retries(), 1 + fails as u64);

        let mut received = Vec::new();
        while received.len() < n {
            if let Some(chain) = channel.try_pop() {
                received.extend(chain.head_index());
                pool.release(chain);
            }
            queue.flush(|_| Some(&channel));
        }
        prop_assert!(queue.is_empty());
        prop_assert!(channel.try_pop().is_none());
        prop_assert_eq!(received, order);
    }
}

#[test]
fn new_chains_queue_behind_waiting_ones() {
    let shared = SharedChunkPool::new(16, 512);
    let mut pool = PrivateChunkPool::new(shared, 0, 16, Duration::from_millis(10));
    let channel = Channel::new(1, Signal::new() as Arc<dyn Wake>);
    let mut queue = OverflowQueue::new(1);
    let mut sent = chains(&mut pool, 3).into_iter();

    assert!(queue.push_or_queue(0, &channel, sent.next().unwrap()));
    assert!(!queue.push_or_queue(0, &channel, sent.next().unwrap()));
    // Room in the channel again, but the queued chain goes first.
    let first = channel.try_pop().unwrap();
    assert!(!queue.push_or_queue(0, &channel, sent.next().unwrap()));
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.flush(|_| Some(&channel)), 1);
    assert_eq!(queue.len(), 1);

    pool.release(first);
    queue.release_all(&mut pool);
    assert!(queue.is_empty());
    if let Some(chain) = channel.try_pop() {
        pool.release(chain);
    }
}

#[test]
fn missing_channel_keeps_the_queue() {
    let shared = SharedChunkPool::new(8, 512);
    let mut pool = PrivateChunkPool::new(shared, 0, 8, Duration::from_millis(10));
    let channel = Channel::new(1, Signal::new() as Arc<dyn Wake>);
    let mut queue = OverflowQueue::new(2);
    for chain in chains(&mut pool, 2) {
        queue.push_or_queue(1, &channel, chain);
    }
    assert_eq!(queue.flush(|_| None), 0);
    assert_eq!(queue.queued_for(1), 1);
    let drained = queue.drain(1);
    assert_eq!(drained.len(), 1);
    for chain in drained {
        pool.release(chain);
    }
    if let Some(chain) = channel.try_pop() {
        pool.release(chain);
    }
}

/// Three sockets forward to a backend whose channel holds one message.
#[test]
fn worker_parks_full_channel_traffic_in_overflow() {
    let (gateway, mut worker) = worker(GatewayConfig {
        channel_capacity: 1,
        ..config()
    });
    let backend = gateway.register_backend("slow").unwrap();
    gateway.register_uri(PORT, Some(Method::Post), "/db", backend, "slow").unwrap();

    let mut bodies = Vec::new();
    for i in 0..3u8 {
        let fd = worker.driver_mut().connect(PORT);
        let body = format!("body-{i}");
        let raw = format!("POST /db HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
        worker.driver_mut().feed(fd, raw.as_bytes());
        bodies.push(body);
    }
    spin(&mut worker, 8);
    assert_eq!(worker.overflow_len(), 2);

    let channel = &gateway.channel(0, backend, 0).to_backend;
    let arena = gateway.shared_pool().arena();
    let mut seen = Vec::new();
    while seen.len() < bodies.len() {
        assert!(turn_until(&mut worker, |_| !channel.is_empty()), "channel stayed empty");
        while let Some(chain) = channel.try_pop() {
            let payload = chain.read_payload(arena);
            let mut parser = HttpParser::default();
            let request = parser.feed(&payload, payload.len()).unwrap().unwrap();
            seen.push(String::from_utf8_lossy(request.body(&payload)).into_owned());
            gateway.shared_pool().release_chain(chain);
        }
    }
    spin(&mut worker, 4);
    assert_eq!(seen, bodies);
    assert_eq!(worker.overflow_len(), 0);
    assert!(channel.try_pop().is_none());
}
