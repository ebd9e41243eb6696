use crate::library::{
    chunk::{ChunkArena, ChunkChain, ChunkIndex},
    error::{GatewayError, GatewayResult},
};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing::{trace, warn};

/// Process-wide pool every private pool refills from.
pub struct SharedChunkPool {
    arena: ChunkArena,
    free: Mutex<Vec<ChunkIndex>>,
    /// Mirror of `free.len()` readable without the lock.
    available: AtomicUsize,
}

impl SharedChunkPool {
    pub fn new(total: usize, chunk_size: usize) -> Arc<SharedChunkPool> {
        let (arena, tokens) = ChunkArena::new(total, chunk_size);
        Arc::new(SharedChunkPool {
            arena,
            available: AtomicUsize::new(tokens.len()),
            free: Mutex::new(tokens),
        })
    }

    #[inline(always)]
    pub fn arena(&self) -> &ChunkArena {
        &self.arena
    }

    #[inline(always)]
    pub fn total(&self) -> usize {
        self.arena.total()
    }

    #[inline(always)]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Moves up to `wanted` chunks into `out` under a bounded-time lock.
    /// Returns how many were moved; a lock timeout is an error so the
    /// caller can back off instead of spinning in the hot path.
    pub fn acquire_from_shared(
        &self,
        wanted: usize,
        timeout: Duration,
        out: &mut Vec<ChunkIndex>,
    ) -> GatewayResult<usize> {
        let Some(mut free) = self.free.try_lock_for(timeout) else {
            warn!("Shared chunk pool lock timed out after {:?}", timeout);
            return Err(GatewayError::SharedPoolTimeout);
        };
        let n = wanted.min(free.len());
        let from = free.len() - n;
        out.extend(free.drain(from..));
        self.available.store(free.len(), Ordering::Release);
        trace!("Shared pool: handed out {} chunks, {} left", n, free.len());
        Ok(n)
    }

    /// Returns chunks to the shared pool. Chunks stay in `chunks` if the
    /// lock could not be taken in time.
    pub fn release_to_shared(&self, chunks: &mut Vec<ChunkIndex>, timeout: Duration) -> bool {
        let Some(mut free) = self.free.try_lock_for(timeout) else {
            return false;
        };
        for mut chunk in chunks.drain(..) {
            self.arena.retire(&mut chunk);
            free.push(chunk);
        }
        self.available.store(free.len(), Ordering::Release);
        true
    }

    /// Returns a whole chain, waiting for the lock as long as it takes.
    /// For cleanup paths outside the hot loop.
    pub fn release_chain(&self, chain: ChunkChain) {
        let mut chunks = chain.into_chunks();
        while !self.release_to_shared(&mut chunks, Duration::from_millis(100)) {
            warn!("Shared chunk pool busy while releasing {} chunks", chunks.len());
        }
    }
}

/// Worker- or backend-private free list in front of the shared pool.
pub struct PrivateChunkPool {
    shared: Arc<SharedChunkPool>,
    free: Vec<ChunkIndex>,
    /// Target size after a refill or a trim.
    target: usize,
    high_water: usize,
    timeout: Duration,
}

impl PrivateChunkPool {
    pub fn new(
        shared: Arc<SharedChunkPool>,
        target: usize,
        high_water: usize,
        timeout: Duration,
    ) -> PrivateChunkPool {
        PrivateChunkPool {
            shared,
            free: Vec::with_capacity(high_water + 1),
            target,
            high_water: high_water.max(target),
            timeout,
        }
    }

    #[inline(always)]
    pub fn arena(&self) -> &ChunkArena {
        self.shared.arena()
    }

    #[inline(always)]
    pub fn shared(&self) -> &Arc<SharedChunkPool> {
        &self.shared
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Hands out exactly `n` chunks, or nothing.
    pub fn acquire(&mut self, n: usize) -> GatewayResult<ChunkChain> {
        assert!(n > 0, "acquire of zero chunks");
        if self.free.len() < n {
            let wanted = (n - self.free.len()).max(self.target.saturating_sub(self.free.len()));
            self.shared
                .acquire_from_shared(wanted, self.timeout, &mut self.free)?;
        }
        if self.free.len() < n {
            return Err(GatewayError::ChunkPoolExhausted {
                requested: n,
                available: self.free.len() + self.shared.available(),
            });
        }
        let from = self.free.len() - n;
        let chunks: Vec<ChunkIndex> = self.free.drain(from..).collect();
        let mut chain = ChunkChain::from_chunks(chunks);
        chain.link(self.shared.arena(), 0);
        Ok(chain)
    }

    /// Takes a chain back, trimming to the shared pool above the high-water mark.
    pub fn release(&mut self, chain: ChunkChain) {
        let arena = self.shared.arena();
        for mut chunk in chain.into_chunks() {
            arena.retire(&mut chunk);
            self.free.push(chunk);
        }
        if self.free.len() > self.high_water {
            self.trim();
        }
    }

    fn trim(&mut self) {
        let keep = self.target.min(self.free.len());
        let mut surplus: Vec<ChunkIndex> = self.free.drain(keep..).collect();
        trace!("Private pool: trimming {} chunks to shared", surplus.len());
        if !self.shared.release_to_shared(&mut surplus, self.timeout) {
            // Lock busy: keep them and try again on the next release.
            self.free.append(&mut surplus);
        }
    }

    /// Hands every private chunk back to the shared pool. Used when a worker
    /// or backend shuts down.
    pub fn drain_to_shared(&mut self) {
        let mut all: Vec<ChunkIndex> = self.free.drain(..).collect();
        while !self.shared.release_to_shared(&mut all, self.timeout) {
            warn!("Shared chunk pool busy while draining {} chunks", all.len());
        }
    }
}

impl Drop for PrivateChunkPool {
    fn drop(&mut self) {
        if !self.free.is_empty() {
            self.drain_to_shared();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::chunk::CHUNK_HEADER_LEN;

    fn pool(total: usize, target: usize) -> PrivateChunkPool {
        let shared = SharedChunkPool::new(total, CHUNK_HEADER_LEN + 64);
        PrivateChunkPool::new(shared, target, target * 2, Duration::from_millis(10))
    }

    #[test]
    fn acquire_refills_from_shared() {
        let mut private = pool(32, 8);
        let chain = private.acquire(3).unwrap();
        assert_eq!(chain.num_chunks(), 3);
        assert_eq!(private.len(), 5);
        assert_eq!(private.shared().available(), 24);
        private.release(chain);
        assert_eq!(private.len(), 8);
    }

    #[test]
    fn over_request_fails_without_partial_allocation() {
        let mut private = pool(4, 2);
        let err = private.acquire(5).unwrap_err();
        assert!(matches!(err, GatewayError::ChunkPoolExhausted { requested: 5, .. }));
        // Whatever was pulled in while trying is still accounted for.
        assert_eq!(private.len() + private.shared().available(), 4);
        let chain = private.acquire(4).unwrap();
        assert_eq!(chain.num_chunks(), 4);
        private.release(chain);
    }

    #[test]
    fn release_trims_above_high_water() {
        let mut private = pool(64, 4);
        let chain = private.acquire(20).unwrap();
        private.release(chain);
        assert_eq!(private.len(), 4);
        assert_eq!(private.shared().available(), 60);
    }

    #[test]
    fn timeout_surfaces_as_error() {
        let private = pool(8, 2);
        let shared = private.shared().clone();
        let _held = shared.free.lock();
        let mut out = Vec::new();
        let err = shared
            .acquire_from_shared(1, Duration::from_millis(1), &mut out)
            .unwrap_err();
        assert!(matches!(err, GatewayError::SharedPoolTimeout));
        assert!(out.is_empty());
    }

    #[test]
    fn released_chunks_get_new_generation() {
        let mut private = pool(1, 1);
        let chain = private.acquire(1).unwrap();
        let chunks = chain.into_chunks();
        let before = chunks[0].generation();
        private.release(ChunkChain::from_chunks(chunks));
        let chain = private.acquire(1).unwrap();
        let chunks = chain.into_chunks();
        assert_ne!(chunks[0].generation(), before);
        private.release(ChunkChain::from_chunks(chunks));
    }
}
