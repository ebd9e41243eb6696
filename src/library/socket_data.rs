//! Per-connection unit of work owned by exactly one worker.
//!
//! Received bytes land directly in chunk memory: the unit keeps a chain of
//! chunks, a fill watermark, and hands the driver scatter descriptors for
//! the free space behind the watermark. Once the parser knows how long the
//! message is, the chain grows to fit it and receiving continues without
//! looking at the consumed bytes again.

use crate::library::{
    chunk::{ChunkArena, ChunkChain, pool::PrivateChunkPool},
    error::{GatewayError, GatewayResult},
    handlers::{BackendId, HandlerId},
    protocol::{
        http::{HttpParser, HttpRequest},
        ws::{self, FrameHeader},
    },
    session::{Protocol, Session},
    worker::driver::Token,
};
use bitflags::bitflags;
use bytes::BytesMut;
use std::{collections::VecDeque, os::fd::RawFd};
use tracing::trace;

/// Longest WebSocket frame header: 2 + 8 length + 4 mask.
const MAX_WS_HEADER: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    Accepting,
    /// Outbound connect still in flight.
    Connecting,
    Receiving,
    Accumulating,
    Dispatching,
    ToBackend,
    Sending,
    Disconnecting,
    Error,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnitFlags: u8 {
        const RECV_PENDING = 1 << 0;
        const SEND_PENDING = 1 << 1;
        const CLOSE_AFTER_SEND = 1 << 2;
        const CLOSE_PENDING = 1 << 3;
        const WS_CLOSE_SENT = 1 << 4;
        /// A backend sends more than one reply for the current request.
        const STREAMING = 1 << 5;
        /// The descriptor's close completed.
        const CLOSED = 1 << 6;
    }
}

#[derive(Debug)]
pub enum MessageKind {
    Http(HttpRequest),
    WsFrame(FrameHeader),
    Raw,
}

#[derive(Debug)]
pub struct Message {
    pub kind: MessageKind,
    /// Bytes from the start of the chain that belong to this message.
    pub len: usize,
}

enum Outgoing {
    Bytes(BytesMut),
    Chain { chain: ChunkChain, len: usize },
}

impl Outgoing {
    fn len(&self) -> usize {
        match self {
            Outgoing::Bytes(bytes) => bytes.len(),
            Outgoing::Chain { len, .. } => *len,
        }
    }
}

pub struct SocketDataUnit {
    fd: RawFd,
    port: u16,
    session: Session,
    stamp: u16,
    state: UnitState,
    protocol: Protocol,
    flags: UnitFlags,
    chain: ChunkChain,
    filled: usize,
    target: Option<usize>,
    parser: HttpParser,
    frame: Option<FrameHeader>,
    recv_iovecs: Vec<libc::iovec>,
    send_iovecs: Vec<libc::iovec>,
    outgoing: VecDeque<Outgoing>,
    sent: usize,
    bound: Option<(Option<BackendId>, HandlerId)>,
    /// The other end of a relay.
    peer: Option<Token>,
}

impl SocketDataUnit {
    pub fn new(fd: RawFd, port: u16, session: Session, stamp: u16, protocol: Protocol) -> SocketDataUnit {
        SocketDataUnit {
            fd,
            port,
            session,
            stamp,
            state: UnitState::Accepting,
            protocol,
            flags: UnitFlags::empty(),
            chain: ChunkChain::default(),
            filled: 0,
            target: None,
            parser: HttpParser::default(),
            frame: None,
            recv_iovecs: Vec::with_capacity(4),
            send_iovecs: Vec::with_capacity(4),
            outgoing: VecDeque::new(),
            sent: 0,
            bound: None,
            peer: None,
        }
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.port
    }
    #[inline(always)]
    pub fn session(&self) -> Session {
        self.session
    }
    #[inline(always)]
    pub fn stamp(&self) -> u16 {
        self.stamp
    }
    #[inline(always)]
    pub fn state(&self) -> UnitState {
        self.state
    }
    #[inline(always)]
    pub fn set_state(&mut self, state: UnitState) {
        trace!("Unit {} {:?} -> {:?}", self.session, self.state, state);
        self.state = state;
    }
    #[inline(always)]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
    #[inline(always)]
    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }
    #[inline(always)]
    pub fn flags(&self) -> UnitFlags {
        self.flags
    }
    #[inline(always)]
    pub fn set_flag(&mut self, flag: UnitFlags, on: bool) {
        self.flags.set(flag, on);
    }
    #[inline(always)]
    pub fn filled(&self) -> usize {
        self.filled
    }
    #[inline(always)]
    pub fn target(&self) -> Option<usize> {
        self.target
    }
    #[inline(always)]
    pub fn chain(&self) -> &ChunkChain {
        &self.chain
    }
    #[inline(always)]
    pub fn bound(&self) -> Option<(Option<BackendId>, HandlerId)> {
        self.bound
    }
    #[inline(always)]
    pub fn bind(&mut self, backend: Option<BackendId>, id: HandlerId) {
        self.bound = Some((backend, id));
    }
    #[inline(always)]
    pub fn peer(&self) -> Option<Token> {
        self.peer
    }
    pub fn pair(&mut self, peer: Token) {
        self.peer = Some(peer);
        self.protocol = Protocol::Relay;
    }
    #[inline(always)]
    pub fn unpair(&mut self) -> Option<Token> {
        self.peer.take()
    }

    /// Grows the chain so the next receive has room, then returns scatter
    /// descriptors over the free chunk memory behind the watermark.
    pub fn prepare_recv(&mut self, pool: &mut PrivateChunkPool, max_chunks: usize) -> GatewayResult<&[libc::iovec]> {
        let payload_size = pool.arena().payload_size();
        let wanted = self.target.unwrap_or(0).max(self.filled + 1);
        let needed = wanted.div_ceil(payload_size);
        if needed > max_chunks {
            return Err(GatewayError::PayloadTooLarge(wanted));
        }
        if needed > self.chain.num_chunks() {
            let more = pool.acquire(needed - self.chain.num_chunks())?;
            self.chain.extend(more);
            trace!("Unit {} grew to {} chunks", self.session, self.chain.num_chunks());
        }
        self.chain.spare_iovecs(pool.arena(), self.filled, &mut self.recv_iovecs);
        self.flags.insert(UnitFlags::RECV_PENDING);
        Ok(&self.recv_iovecs)
    }

    /// Moves the watermark after a receive completed with `n` bytes.
    pub fn advance(&mut self, n: usize) {
        self.flags.remove(UnitFlags::RECV_PENDING);
        self.filled += n;
    }

    /// Copies `data` behind the watermark. Used for bytes that did not
    /// arrive through `prepare_recv`, such as a handed-over connection.
    pub fn push_bytes(&mut self, pool: &mut PrivateChunkPool, data: &[u8], max_chunks: usize) -> GatewayResult<()> {
        let payload_size = pool.arena().payload_size();
        let needed = (self.filled + data.len()).div_ceil(payload_size);
        if needed > max_chunks {
            return Err(GatewayError::PayloadTooLarge(self.filled + data.len()));
        }
        if needed > self.chain.num_chunks() {
            let more = pool.acquire(needed - self.chain.num_chunks())?;
            self.chain.extend(more);
        }
        self.filled += self.chain.write_at(pool.arena(), self.filled, data);
        Ok(())
    }

    /// Checks whether a complete message sits at the start of the chain.
    /// The header block of an HTTP request has to fit the first chunk;
    /// messages longer than `max_chunks` chunks fail as too large.
    pub fn poll_message(&mut self, arena: &ChunkArena, max_chunks: usize) -> GatewayResult<Option<Message>> {
        if self.filled == 0 {
            return Ok(None);
        }
        let payload_size = arena.payload_size();
        let ceiling = max_chunks * payload_size;
        match self.protocol {
            Protocol::Http1 => {
                if self.target.is_none() {
                    let head_end = self.filled.min(payload_size);
                    let head = self.chain.contiguous(arena, 0, head_end).unwrap_or(&[]);
                    let Some(request) = self.parser.feed(head, payload_size)? else {
                        return Ok(None);
                    };
                    let total = request.total_len();
                    if total > ceiling {
                        return Err(GatewayError::PayloadTooLarge(total));
                    }
                    self.target = Some(total);
                }
                Ok(self.complete(|unit| unit.parser.take().map(MessageKind::Http)))
            }
            Protocol::WebSocket => {
                if self.target.is_none() {
                    let head_end = self.filled.min(payload_size).min(MAX_WS_HEADER);
                    let head = self.chain.contiguous(arena, 0, head_end).unwrap_or(&[]);
                    let Some(header) = ws::parse_frame_header(head)? else {
                        return Ok(None);
                    };
                    if header.frame_len() > ceiling {
                        return Err(GatewayError::PayloadTooLarge(header.frame_len()));
                    }
                    self.target = Some(header.frame_len());
                    self.frame = Some(header);
                }
                Ok(self.complete(|unit| unit.frame.take().map(MessageKind::WsFrame)))
            }
            Protocol::Raw | Protocol::Relay => Ok(Some(Message {
                kind: MessageKind::Raw,
                len: self.filled,
            })),
        }
    }

    fn complete(&mut self, kind: impl FnOnce(&mut Self) -> Option<MessageKind>) -> Option<Message> {
        let target = self.target?;
        if self.filled < target {
            self.state = UnitState::Accumulating;
            return None;
        }
        let kind = kind(self)?;
        Some(Message { kind, len: target })
    }

    /// Detaches the first `len` bytes as a chain of their own. Bytes past
    /// `len` (a pipelined request) stay in the unit at offset zero.
    pub fn take_message(&mut self, pool: &mut PrivateChunkPool, len: usize) -> GatewayResult<ChunkChain> {
        let payload_size = pool.arena().payload_size();
        let surplus = self.filled.saturating_sub(len);
        let mut carry = Vec::new();
        if surplus > 0 {
            self.chain.copy_range(pool.arena(), len, self.filled, &mut carry);
        }
        let used = len.div_ceil(payload_size).max(1);
        let rest = self.chain.split_off(used);
        if !rest.is_empty() {
            pool.release(rest);
        }
        let mut message = std::mem::take(&mut self.chain);
        message.link(pool.arena(), len);
        self.filled = 0;
        self.target = None;
        self.frame = None;
        self.parser.reset();
        if surplus > 0 {
            match pool.acquire(surplus.div_ceil(payload_size)) {
                Ok(mut chain) => {
                    chain.write_at(pool.arena(), 0, &carry);
                    self.chain = chain;
                    self.filled = surplus;
                }
                Err(err) => {
                    pool.release(message);
                    return Err(err);
                }
            }
        }
        Ok(message)
    }

    /// Drops the first `len` bytes without handing them anywhere.
    pub fn discard_message(&mut self, pool: &mut PrivateChunkPool, len: usize) -> GatewayResult<()> {
        let message = self.take_message(pool, len)?;
        pool.release(message);
        Ok(())
    }

    pub fn queue_bytes(&mut self, bytes: BytesMut) {
        if !bytes.is_empty() {
            self.outgoing.push_back(Outgoing::Bytes(bytes));
        }
    }

    /// Queues a chain whose chunks carry `len` payload bytes for the socket.
    pub fn queue_chain(&mut self, chain: ChunkChain, len: usize, pool: &mut PrivateChunkPool) {
        if len == 0 {
            pool.release(chain);
            return;
        }
        self.outgoing.push_back(Outgoing::Chain { chain, len });
    }

    #[inline(always)]
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Gather descriptors for what is left of the front outgoing item.
    pub fn prepare_send(&mut self, arena: &ChunkArena) -> Option<&[libc::iovec]> {
        self.send_iovecs.clear();
        let mut skip = self.sent;
        match self.outgoing.front()? {
            Outgoing::Bytes(bytes) => {
                let rest = &bytes[skip..];
                self.send_iovecs.push(libc::iovec {
                    iov_base: rest.as_ptr() as *mut libc::c_void,
                    iov_len: rest.len(),
                });
            }
            Outgoing::Chain { chain, .. } => {
                for slice in chain.payload_slices(arena) {
                    if skip >= slice.len() {
                        skip -= slice.len();
                        continue;
                    }
                    let rest = &slice[skip..];
                    skip = 0;
                    self.send_iovecs.push(libc::iovec {
                        iov_base: rest.as_ptr() as *mut libc::c_void,
                        iov_len: rest.len(),
                    });
                }
            }
        }
        self.flags.insert(UnitFlags::SEND_PENDING);
        Some(&self.send_iovecs)
    }

    /// Accounts `n` sent bytes. Returns true once nothing is left to send.
    pub fn complete_send(&mut self, n: usize, pool: &mut PrivateChunkPool) -> bool {
        self.flags.remove(UnitFlags::SEND_PENDING);
        self.sent += n;
        while let Some(front) = self.outgoing.front() {
            if self.sent < front.len() {
                break;
            }
            self.sent -= front.len();
            if let Some(Outgoing::Chain { chain, .. }) = self.outgoing.pop_front() {
                pool.release(chain);
            }
        }
        self.outgoing.is_empty()
    }

    /// Drops buffered input, keeping queued output.
    pub fn reset_input(&mut self, pool: &mut PrivateChunkPool) {
        let chain = std::mem::take(&mut self.chain);
        if !chain.is_empty() {
            pool.release(chain);
        }
        self.filled = 0;
        self.target = None;
        self.frame = None;
        self.parser.reset();
    }

    /// Returns every chunk the unit holds.
    pub fn release_all(&mut self, pool: &mut PrivateChunkPool) {
        let chain = std::mem::take(&mut self.chain);
        if !chain.is_empty() {
            pool.release(chain);
        }
        for item in self.outgoing.drain(..) {
            if let Outgoing::Chain { chain, .. } = item {
                pool.release(chain);
            }
        }
        self.filled = 0;
        self.target = None;
        self.sent = 0;
        self.parser.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::chunk::{CHUNK_HEADER_LEN, pool::SharedChunkPool};
    use std::time::Duration;

    const PAYLOAD: usize = 64;

    fn pool() -> PrivateChunkPool {
        let shared = SharedChunkPool::new(64, CHUNK_HEADER_LEN + PAYLOAD);
        PrivateChunkPool::new(shared, 8, 16, Duration::from_millis(10))
    }

    fn unit(protocol: Protocol) -> SocketDataUnit {
        let session = Session {
            salt: 7,
            slot: 1,
            worker: 0,
        };
        SocketDataUnit::new(3, 80, session, 1, protocol)
    }

    /// Plays the kernel: copies `data` into the receive descriptors.
    fn deliver(unit: &mut SocketDataUnit, pool: &mut PrivateChunkPool, data: &[u8]) -> usize {
        let iovecs = unit.prepare_recv(pool, 16).unwrap().to_vec();
        let mut copied = 0;
        for iov in iovecs {
            let n = iov.iov_len.min(data.len() - copied);
            unsafe { std::ptr::copy_nonoverlapping(data[copied..].as_ptr(), iov.iov_base as *mut u8, n) };
            copied += n;
            if copied == data.len() {
                break;
            }
        }
        unit.advance(copied);
        copied
    }

    #[test]
    fn body_spanning_chunks_accumulates() {
        let mut pool = pool();
        let mut unit = unit(Protocol::Http1);
        let body = vec![b'z'; 150];
        let mut raw = format!("POST /up HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(&body);

        let mut at = 0;
        while at < raw.len() {
            at += deliver(&mut unit, &mut pool, &raw[at..]);
            if at < raw.len() {
                assert!(unit.poll_message(pool.arena(), 16).unwrap().is_none());
            }
        }
        assert_eq!(unit.state(), UnitState::Accumulating);
        let message = unit.poll_message(pool.arena(), 16).unwrap().unwrap();
        assert_eq!(message.len, raw.len());
        let chain = unit.take_message(&mut pool, message.len).unwrap();
        assert_eq!(chain.read_payload(pool.arena()), raw);
        pool.release(chain);
        assert_eq!(unit.filled(), 0);
    }

    #[test]
    fn pipelined_request_is_carried_over() {
        let mut pool = pool();
        let mut unit = unit(Protocol::Http1);
        let two = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        deliver(&mut unit, &mut pool, two);
        let first = unit.poll_message(pool.arena(), 16).unwrap().unwrap();
        assert_eq!(first.len, 19);
        unit.discard_message(&mut pool, first.len).unwrap();
        assert_eq!(unit.filled(), 19);
        let second = unit.poll_message(pool.arena(), 16).unwrap().unwrap();
        let MessageKind::Http(request) = &second.kind else {
            panic!("expected HTTP");
        };
        let chain = unit.take_message(&mut pool, second.len).unwrap();
        let bytes = chain.read_payload(pool.arena());
        assert_eq!(request.uri.slice(&bytes), b"/b");
        pool.release(chain);
    }

    #[test]
    fn oversized_content_length_fails_before_receiving() {
        let mut pool = pool();
        let mut unit = unit(Protocol::Http1);
        deliver(&mut unit, &mut pool, b"POST / HTTP/1.1\r\nContent-Length: 5000\r\n\r\n");
        let err = unit.poll_message(pool.arena(), 16).unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge(_)));
        unit.release_all(&mut pool);
    }

    #[test]
    fn content_length_near_usize_max_is_too_large() {
        let mut pool = pool();
        for raw in [
            "POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n",
            "POST / HTTP/1.1\r\nContent-Length: 18446744073709551600\r\n\r\n",
        ] {
            let mut unit = unit(Protocol::Http1);
            deliver(&mut unit, &mut pool, raw.as_bytes());
            let err = unit.poll_message(pool.arena(), 16).unwrap_err();
            assert!(matches!(err, GatewayError::PayloadTooLarge(_)), "{raw:?} gave {err:?}");
            unit.release_all(&mut pool);
        }
    }

    #[test]
    fn send_progress_releases_chains() {
        let mut pool = pool();
        let mut unit = unit(Protocol::Http1);
        let mut chain = pool.acquire(2).unwrap();
        chain.write_payload(pool.arena(), &[1u8; 100]);
        unit.queue_bytes(BytesMut::from(&b"head"[..]));
        unit.queue_chain(chain, 100, &mut pool);
        let lens: Vec<usize> = unit.prepare_send(pool.arena()).unwrap().iter().map(|v| v.iov_len).collect();
        assert_eq!(lens, vec![4]);
        assert!(!unit.complete_send(4, &mut pool));
        assert!(!unit.complete_send(70, &mut pool));
        let lens: Vec<usize> = unit.prepare_send(pool.arena()).unwrap().iter().map(|v| v.iov_len).collect();
        assert_eq!(lens, vec![30]);
        let before = pool.len();
        assert!(unit.complete_send(30, &mut pool));
        assert_eq!(pool.len(), before + 2);
    }

    #[test]
    fn websocket_frame_length_comes_from_header() {
        let mut pool = pool();
        let mut unit = unit(Protocol::WebSocket);
        deliver(&mut unit, &mut pool, &[0x81, 0x85, 1, 2, 3]);
        assert!(unit.poll_message(pool.arena(), 16).unwrap().is_none());
        deliver(&mut unit, &mut pool, &[4, b'h' ^ 1, b'e' ^ 2, b'l' ^ 3, b'l' ^ 4, b'o' ^ 1]);
        let message = unit.poll_message(pool.arena(), 16).unwrap().unwrap();
        assert_eq!(message.len, 11);
        assert!(matches!(message.kind, MessageKind::WsFrame(h) if h.payload_len == 5));
        unit.release_all(&mut pool);
    }
}
