use crate::library::{
    chunk::{ChunkArena, ChunkChain},
    gateway::Gateway,
    handlers::BackendId,
    protocol::{http::HttpRequest, http::Span, ws::Opcode},
    session::{Protocol, Session},
};
use bytes::BytesMut;
use std::{borrow::Cow, net::SocketAddr};

/// What the worker does once the handler chain returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    /// Send `reply`; close afterwards when `close` is set.
    Reply { close: bool },
    /// Hand the message chunks to a backend.
    Forward { backend: BackendId },
    /// Send `reply` (a 101) and switch the socket to WebSocket frames.
    Upgrade { backend: Option<BackendId> },
    /// Connect to `destination` and relay the socket there from now on.
    Proxy { destination: SocketAddr },
    Disconnect,
}

/// Read-only view of `len` message bytes starting at `start` in a chain.
#[derive(Clone, Copy)]
pub struct MessageView<'a> {
    arena: &'a ChunkArena,
    chain: &'a ChunkChain,
    start: usize,
    len: usize,
}

impl<'a> MessageView<'a> {
    pub fn new(arena: &'a ChunkArena, chain: &'a ChunkChain, start: usize, len: usize) -> MessageView<'a> {
        MessageView {
            arena,
            chain,
            start,
            len,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes `from..to` of the message. Borrowed when they sit in one chunk.
    pub fn slice(&self, from: usize, to: usize) -> Cow<'a, [u8]> {
        let to = to.min(self.len);
        let from = from.min(to);
        let (from, to) = (self.start + from, self.start + to);
        match self.chain.contiguous(self.arena, from, to) {
            Some(bytes) => Cow::Borrowed(bytes),
            None => {
                let mut out = Vec::with_capacity(to - from);
                self.chain.copy_range(self.arena, from, to, &mut out);
                Cow::Owned(out)
            }
        }
    }

    pub fn span(&self, span: Span) -> Cow<'a, [u8]> {
        self.slice(span.start as usize, span.end())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.slice(0, self.len).into_owned()
    }
}

/// Everything a handler sees while it runs on a worker.
pub struct HandlerContext<'a> {
    pub gateway: &'a Gateway,
    pub worker: u8,
    pub port: u16,
    pub session: Session,
    pub protocol: Protocol,
    pub request: Option<&'a HttpRequest>,
    /// Opcode of the frame for WebSocket messages.
    pub frame: Option<Opcode>,
    pub message: MessageView<'a>,
    pub reply: &'a mut BytesMut,
    action: Action,
}

impl<'a> HandlerContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: &'a Gateway,
        worker: u8,
        port: u16,
        session: Session,
        protocol: Protocol,
        request: Option<&'a HttpRequest>,
        frame: Option<Opcode>,
        message: MessageView<'a>,
        reply: &'a mut BytesMut,
    ) -> HandlerContext<'a> {
        HandlerContext {
            gateway,
            worker,
            port,
            session,
            protocol,
            request,
            frame,
            message,
            reply,
            action: Action::None,
        }
    }

    #[inline(always)]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Request body for HTTP messages, the whole message otherwise.
    pub fn body(&self) -> Cow<'a, [u8]> {
        match self.request {
            Some(request) => self.message.slice(request.header_len, request.total_len()),
            None => self.message.slice(0, self.message.len()),
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.request.is_none_or(|r| r.keep_alive)
    }

    /// Marks `reply` for sending, honoring `Connection: close`.
    pub fn respond(&mut self) {
        self.action = Action::Reply {
            close: !self.keep_alive(),
        };
    }

    pub fn respond_and_close(&mut self) {
        self.action = Action::Reply { close: true };
    }

    pub fn forward(&mut self, backend: BackendId) {
        self.action = Action::Forward { backend };
    }

    pub fn upgrade(&mut self, backend: Option<BackendId>) {
        self.action = Action::Upgrade { backend };
    }

    pub fn proxy(&mut self, destination: SocketAddr) {
        self.action = Action::Proxy { destination };
    }

    pub fn disconnect(&mut self) {
        self.action = Action::Disconnect;
    }
}
