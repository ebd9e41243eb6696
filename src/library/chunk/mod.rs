//! Fixed-size transfer chunks shared between workers and backends.
//!
//! All chunk memory lives in one [`ChunkArena`]. A chunk can only be read or
//! written through its [`ChunkIndex`], a move-only token handed out by the
//! pools, so at any moment exactly one owner (a private pool, the shared pool,
//! a socket unit or a channel slot) can touch a given chunk.

mod header;
pub mod pool;

pub use header::{CHUNK_HEADER_LEN, ChunkFlags, ChunkHeader, ChunkOp, Direction, LINK_TERMINATOR};

use std::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};
use tracing::error;

/// Ownership token for one chunk. Not `Clone`: moving it moves the chunk.
pub struct ChunkIndex {
    index: u32,
    generation: u32,
}

impl ChunkIndex {
    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }
    #[inline(always)]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}@{}", self.index, self.generation)
    }
}

struct ChunkSlot {
    generation: AtomicU32,
    data: UnsafeCell<Box<[u8]>>,
}

pub struct ChunkArena {
    chunk_size: usize,
    slots: Box<[ChunkSlot]>,
}

// Access to a slot's bytes requires its unique `ChunkIndex`.
unsafe impl Sync for ChunkArena {}
unsafe impl Send for ChunkArena {}

impl ChunkArena {
    /// Builds the arena and returns the tokens for every chunk in it.
    pub(crate) fn new(total: usize, chunk_size: usize) -> (ChunkArena, Vec<ChunkIndex>) {
        assert!(chunk_size > CHUNK_HEADER_LEN, "chunk cannot hold its own header");
        let slots: Box<[ChunkSlot]> = (0..total)
            .map(|_| ChunkSlot {
                generation: AtomicU32::new(0),
                data: UnsafeCell::new(vec![0u8; chunk_size].into_boxed_slice()),
            })
            .collect();
        let tokens = (0..total as u32)
            .map(|index| ChunkIndex {
                index,
                generation: 0,
            })
            .collect();
        (ChunkArena { chunk_size, slots }, tokens)
    }

    #[inline(always)]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline(always)]
    pub fn payload_size(&self) -> usize {
        self.chunk_size - CHUNK_HEADER_LEN
    }

    #[inline(always)]
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    fn slot(&self, chunk: &ChunkIndex) -> &ChunkSlot {
        let slot = &self.slots[chunk.index as usize];
        assert_eq!(
            slot.generation.load(Ordering::Relaxed),
            chunk.generation,
            "stale chunk token {chunk:?}"
        );
        slot
    }

    pub fn bytes<'a>(&'a self, chunk: &'a ChunkIndex) -> &'a [u8] {
        let slot = self.slot(chunk);
        unsafe { &*slot.data.get() }
    }

    pub fn bytes_mut<'a>(&'a self, chunk: &'a mut ChunkIndex) -> &'a mut [u8] {
        let slot = self.slot(chunk);
        unsafe { &mut *slot.data.get() }
    }

    #[inline(always)]
    pub fn header(&self, chunk: &ChunkIndex) -> ChunkHeader {
        ChunkHeader::read_from(self.bytes(chunk))
    }

    #[inline(always)]
    pub fn set_header(&self, chunk: &mut ChunkIndex, header: &ChunkHeader) {
        header.write_to(self.bytes_mut(chunk));
    }

    pub fn payload<'a>(&'a self, chunk: &'a ChunkIndex) -> &'a [u8] {
        &self.bytes(chunk)[CHUNK_HEADER_LEN..]
    }

    pub fn payload_mut<'a>(&'a self, chunk: &'a mut ChunkIndex) -> &'a mut [u8] {
        &mut self.bytes_mut(chunk)[CHUNK_HEADER_LEN..]
    }

    /// Bumps the generation when a chunk goes back to a pool.
    pub(crate) fn retire(&self, chunk: &mut ChunkIndex) {
        let slot = self.slot(chunk);
        let next = chunk.generation.wrapping_add(1);
        slot.generation.store(next, Ordering::Relaxed);
        chunk.generation = next;
    }
}

/// A head chunk plus the chunks linked behind it.
///
/// Every chunk carries a header; the head's header describes the whole
/// message, the rest only keep `next` and `len` current.
#[derive(Default)]
pub struct ChunkChain {
    chunks: Vec<ChunkIndex>,
}

impl ChunkChain {
    pub(crate) fn from_chunks(chunks: Vec<ChunkIndex>) -> ChunkChain {
        ChunkChain { chunks }
    }

    #[inline(always)]
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn head_index(&self) -> Option<u32> {
        self.chunks.first().map(ChunkIndex::index)
    }

    pub fn capacity(&self, arena: &ChunkArena) -> usize {
        self.chunks.len() * arena.payload_size()
    }

    pub fn extend(&mut self, mut more: ChunkChain) {
        self.chunks.append(&mut more.chunks);
    }

    /// Detaches the chunks from position `at` on.
    pub fn split_off(&mut self, at: usize) -> ChunkChain {
        ChunkChain {
            chunks: self.chunks.split_off(at.min(self.chunks.len())),
        }
    }

    pub(crate) fn into_chunks(mut self) -> Vec<ChunkIndex> {
        std::mem::take(&mut self.chunks)
    }

    pub fn header(&self, arena: &ChunkArena) -> ChunkHeader {
        match self.chunks.first() {
            Some(head) => arena.header(head),
            None => ChunkHeader::default(),
        }
    }

    /// Writes the head header, then rewrites links and per-chunk lengths
    /// for `header.total_len` payload bytes.
    pub fn set_header(&mut self, arena: &ChunkArena, header: &ChunkHeader) {
        if let Some(head) = self.chunks.first_mut() {
            arena.set_header(head, header);
        }
        self.link(arena, header.total_len as usize);
    }

    /// Rewrites `next`, `len`, `linked` and `total_len` so the chain
    /// describes `total_len` payload bytes.
    pub fn link(&mut self, arena: &ChunkArena, total_len: usize) {
        let payload_size = arena.payload_size();
        let count = self.chunks.len();
        let indexes: Vec<u32> = self.chunks.iter().map(ChunkIndex::index).collect();
        let mut left = total_len;
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            let mut header = arena.header(chunk);
            let here = left.min(payload_size);
            left -= here;
            header.len = here as u32;
            header.next = indexes.get(i + 1).copied().unwrap_or(LINK_TERMINATOR);
            if i == 0 {
                header.linked = (count - 1) as u32;
                header.total_len = total_len as u32;
            }
            arena.set_header(chunk, &header);
        }
    }

    /// Copies `data` into the chain starting at payload offset `offset`.
    /// Returns how many bytes fit.
    pub fn write_at(&mut self, arena: &ChunkArena, offset: usize, data: &[u8]) -> usize {
        let payload_size = arena.payload_size();
        let mut written = 0;
        let mut position = offset;
        while written < data.len() {
            let chunk_no = position / payload_size;
            let Some(chunk) = self.chunks.get_mut(chunk_no) else {
                break;
            };
            let within = position % payload_size;
            let payload = arena.payload_mut(chunk);
            let n = (payload_size - within).min(data.len() - written);
            payload[within..within + n].copy_from_slice(&data[written..written + n]);
            written += n;
            position += n;
        }
        written
    }

    /// Writes `data` from offset 0 and links the chain for exactly that many bytes.
    pub fn write_payload(&mut self, arena: &ChunkArena, data: &[u8]) -> usize {
        let written = self.write_at(arena, 0, data);
        self.link(arena, written);
        written
    }

    /// Contiguous view of payload bytes `from..to` if they sit in one chunk.
    pub fn contiguous<'a>(&'a self, arena: &'a ChunkArena, from: usize, to: usize) -> Option<&'a [u8]> {
        let payload_size = arena.payload_size();
        if to < from || (to > from && from / payload_size != (to - 1) / payload_size) {
            return None;
        }
        let chunk = self.chunks.get(from / payload_size)?;
        let within = from % payload_size;
        Some(&arena.payload(chunk)[within..within + (to - from)])
    }

    /// Appends payload bytes `from..to` to `out`.
    pub fn copy_range(&self, arena: &ChunkArena, from: usize, to: usize, out: &mut Vec<u8>) {
        let payload_size = arena.payload_size();
        let mut position = from;
        while position < to {
            let Some(chunk) = self.chunks.get(position / payload_size) else {
                break;
            };
            let within = position % payload_size;
            let n = (payload_size - within).min(to - position);
            out.extend_from_slice(&arena.payload(chunk)[within..within + n]);
            position += n;
        }
    }

    /// Calls `f` on each contiguous piece of payload bytes `from..to`
    /// together with the piece's offset relative to `from`.
    pub fn for_each_mut(&mut self, arena: &ChunkArena, from: usize, to: usize, mut f: impl FnMut(&mut [u8], usize)) {
        let payload_size = arena.payload_size();
        let mut position = from;
        while position < to {
            let Some(chunk) = self.chunks.get_mut(position / payload_size) else {
                break;
            };
            let within = position % payload_size;
            let n = (payload_size - within).min(to - position);
            f(&mut arena.payload_mut(chunk)[within..within + n], position - from);
            position += n;
        }
    }

    /// Reads the payload following the links, the way a backend sees it.
    pub fn read_payload(&self, arena: &ChunkArena) -> Vec<u8> {
        let total = self.header(arena).total_len as usize;
        let mut out = Vec::with_capacity(total);
        for chunk in &self.chunks {
            let len = arena.header(chunk).len as usize;
            out.extend_from_slice(&arena.payload(chunk)[..len]);
        }
        out
    }

    /// Slices for each chunk's used payload, in order. Used to build
    /// scatter/gather send descriptors.
    pub fn payload_slices<'a>(&'a self, arena: &'a ChunkArena) -> Vec<&'a [u8]> {
        self.chunks
            .iter()
            .map(|chunk| {
                let len = arena.header(chunk).len as usize;
                &arena.payload(chunk)[..len]
            })
            .collect()
    }

    /// Scatter descriptors covering the free payload space after `filled`.
    pub fn spare_iovecs(&mut self, arena: &ChunkArena, filled: usize, out: &mut Vec<libc::iovec>) {
        out.clear();
        let payload_size = arena.payload_size();
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            let start = i * payload_size;
            let end = start + payload_size;
            if end <= filled {
                continue;
            }
            let within = filled.saturating_sub(start);
            let payload = arena.payload_mut(chunk);
            out.push(libc::iovec {
                iov_base: payload[within..].as_mut_ptr() as *mut libc::c_void,
                iov_len: payload_size - within,
            });
        }
    }
}

impl fmt::Debug for ChunkChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.chunks.iter()).finish()
    }
}

impl Drop for ChunkChain {
    fn drop(&mut self) {
        if !self.chunks.is_empty() {
            error!("Chunk chain dropped without release: {} chunks leaked", self.chunks.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(total: usize, chunk_size: usize) -> (ChunkArena, Vec<ChunkIndex>) {
        ChunkArena::new(total, chunk_size)
    }

    #[test]
    fn payload_spans_linked_chunks() {
        let (arena, tokens) = arena_with(4, CHUNK_HEADER_LEN + 10);
        let mut chain = ChunkChain::from_chunks(tokens);
        let data: Vec<u8> = (0u8..35).collect();
        assert_eq!(chain.write_payload(&arena, &data), 35);
        let head = chain.header(&arena);
        assert_eq!(head.linked, 3);
        assert_eq!(head.total_len, 35);
        assert_eq!(chain.read_payload(&arena), data);
        let lens: Vec<usize> = chain.payload_slices(&arena).iter().map(|s| s.len()).collect();
        assert_eq!(lens, vec![10, 10, 10, 5]);
        let _ = chain.into_chunks();
    }

    #[test]
    fn links_terminate() {
        let (arena, tokens) = arena_with(3, CHUNK_HEADER_LEN + 8);
        let mut chain = ChunkChain::from_chunks(tokens);
        chain.link(&arena, 20);
        let chunks = chain.into_chunks();
        assert_eq!(arena.header(&chunks[0]).next, 1);
        assert_eq!(arena.header(&chunks[1]).next, 2);
        assert_eq!(arena.header(&chunks[2]).next, LINK_TERMINATOR);
        assert_eq!(arena.header(&chunks[2]).len, 4);
    }

    #[test]
    fn contiguous_only_within_one_chunk() {
        let (arena, tokens) = arena_with(2, CHUNK_HEADER_LEN + 8);
        let mut chain = ChunkChain::from_chunks(tokens);
        chain.write_payload(&arena, b"0123456789AB");
        assert_eq!(chain.contiguous(&arena, 2, 6), Some(&b"2345"[..]));
        assert_eq!(chain.contiguous(&arena, 6, 10), None);
        let mut out = Vec::new();
        chain.copy_range(&arena, 6, 10, &mut out);
        assert_eq!(out, b"6789");
        let _ = chain.into_chunks();
    }

    #[test]
    fn spare_iovecs_skip_filled_space() {
        let (arena, tokens) = arena_with(3, CHUNK_HEADER_LEN + 8);
        let mut chain = ChunkChain::from_chunks(tokens);
        let mut iovecs = Vec::new();
        chain.spare_iovecs(&arena, 10, &mut iovecs);
        let lens: Vec<usize> = iovecs.iter().map(|v| v.iov_len).collect();
        assert_eq!(lens, vec![6, 8]);
        let _ = chain.into_chunks();
    }

    #[test]
    #[should_panic(expected = "stale chunk token")]
    fn retired_generation_rejects_old_token() {
        let (arena, mut tokens) = arena_with(1, CHUNK_HEADER_LEN + 8);
        let mut token = tokens.pop().unwrap();
        let forged = ChunkIndex {
            index: token.index,
            generation: token.generation,
        };
        arena.retire(&mut token);
        arena.bytes(&forged);
    }
}
