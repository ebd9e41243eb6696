use nexgate::library::{
    chunk::{ChunkChain, pool::{PrivateChunkPool, SharedChunkPool}},
    error::GatewayError,
};
use proptest::prelude::*;
use std::time::Duration;

const TOTAL: usize = 64;
const CHUNK: usize = 128;

fn pools() -> (std::sync::Arc<SharedChunkPool>, PrivateChunkPool, PrivateChunkPool) {
    let shared = SharedChunkPool::new(TOTAL, CHUNK);
    let a = PrivateChunkPool::new(shared.clone(), 4, 8, Duration::from_millis(10));
    let b = PrivateChunkPool::new(shared.clone(), 4, 8, Duration::from_millis(10));
    (shared, a, b)
}

#[derive(Debug, Clone)]
enum Op {
    Acquire { pool: bool, n: usize },
    Release { pool: bool, which: usize },
    /// Chain moves from one owner to the other, as on a channel.
    Hand { which: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<bool>(), 1usize..24).prop_map(|(pool, n)| Op::Acquire { pool, n }),
        (any::<bool>(), 0usize..16).prop_map(|(pool, which)| Op::Release { pool, which }),
        (0usize..16).prop_map(|which| Op::Hand { which }),
    ]
}

proptest! {
    #[test]
    fn chunks_are_conserved(ops in proptest::collection::vec(op(), 1..80)) {
        let (shared, mut a, mut b) = pools();
        let mut held: Vec<ChunkChain> = Vec::new();
        for op in ops {
            match op {
                Op::Acquire { pool, n } => {
                    let target = if pool { &mut a } else { &mut b };
                    match target.acquire(n) {
                        Ok(chain) => {
                            prop_assert_eq!(chain.num_chunks(), n);
                            held.push(chain);
                        }
                        Err(err) => prop_assert!(
                            matches!(err, GatewayError::ChunkPoolExhausted { .. }),
                            "unexpected error {}", err
                        ),
                    }
                }
                Op::Release { pool, which } => {
                    if !held.is_empty() {
                        let chain = held.swap_remove(which % held.len());
                        if pool { a.release(chain) } else { b.release(chain) }
                    }
                }
                Op::Hand { which } => {
                    if !held.is_empty() {
                        let at = which % held.len();
                        let chain = held.remove(at);
                        held.push(chain);
                    }
                }
            }
            let outstanding: usize = held.iter().map(ChunkChain::num_chunks).sum();
            prop_assert_eq!(outstanding + a.len() + b.len() + shared.available(), TOTAL);
        }
        for chain in held.drain(..) {
            a.release(chain);
        }
        a.drain_to_shared();
        b.drain_to_shared();
        prop_assert_eq!(shared.available(), TOTAL);
    }
}

#[test]
fn over_acquire_fails_without_handing_out_chunks() {
    let (shared, mut a, _b) = pools();
    let err = a.acquire(TOTAL + 1).err().expect("must fail");
    assert!(matches!(err, GatewayError::ChunkPoolExhausted { requested, .. } if requested == TOTAL + 1));
    assert_eq!(a.len() + shared.available(), TOTAL);
    let all = a.acquire(TOTAL).expect("whole pool");
    assert_eq!(all.num_chunks(), TOTAL);
    assert_eq!(shared.available(), 0);
    a.release(all);
}

#[test]
fn private_pool_trims_above_high_water() {
    let (shared, mut a, _b) = pools();
    let chain = a.acquire(20).unwrap();
    a.release(chain);
    assert!(a.len() <= 8, "kept {} chunks", a.len());
    assert_eq!(a.len() + shared.available(), TOTAL);
}

#[test]
fn payload_spans_linked_chunks() {
    let (_shared, mut a, _b) = pools();
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let chunks = payload.len().div_ceil(a.arena().payload_size());
    let mut chain = a.acquire(chunks).unwrap();
    assert_eq!(chain.write_payload(a.arena(), &payload), payload.len());
    let header = chain.header(a.arena());
    assert_eq!(header.total_len as usize, payload.len());
    assert_eq!(header.linked as usize, chunks - 1);
    assert_eq!(chain.read_payload(a.arena()), payload);
    a.release(chain);
}
