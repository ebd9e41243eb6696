//! Backend side of the channels.
//!
//! A backend registers a name with the gateway and runs one scheduler
//! thread per configured scheduler index. Each scheduler drains the
//! `to_backend` side of its channel on every worker, hands the message to
//! the application and pushes the answer back on `from_backend`.

use crate::library::{
    channel::Wake,
    chunk::{ChunkChain, ChunkFlags, ChunkHeader, ChunkOp, Direction, pool::PrivateChunkPool},
    error::{GatewayError, GatewayResult},
    gateway::Gateway,
    handlers::BackendId,
    protocol::http::{HttpParser, HttpRequest},
    session::Session,
};
use bytes::{BufMut, BytesMut};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};
use tracing::{debug, info, trace, warn};

const MAX_POPS_PER_WORKER: usize = 64;
const IDLE_WAIT: Duration = Duration::from_millis(100);
const RETRY_WAIT: Duration = Duration::from_millis(1);

/// One message taken off a worker channel.
#[derive(Debug)]
pub struct BackendMessage<'a> {
    pub op: ChunkOp,
    pub session: Session,
    pub port: u16,
    pub handler: u16,
    pub flags: ChunkFlags,
    pub payload: &'a [u8],
}

impl BackendMessage<'_> {
    #[inline(always)]
    pub fn keep_alive(&self) -> bool {
        self.flags.contains(ChunkFlags::KEEP_ALIVE)
    }

    #[inline(always)]
    pub fn is_text(&self) -> bool {
        self.flags.contains(ChunkFlags::WS_TEXT)
    }

    /// Request head of an HTTP message, or `None` for other ops.
    pub fn request(&self) -> GatewayResult<Option<HttpRequest>> {
        if self.op != ChunkOp::HttpRequest {
            return Ok(None);
        }
        let mut parser = HttpParser::default();
        match parser.feed(self.payload, self.payload.len())? {
            Some(request) => Ok(Some(request.clone())),
            None => Err(GatewayError::IncompleteHeaders),
        }
    }

    /// HTTP body, or the whole payload for WebSocket and raw messages.
    pub fn body(&self) -> GatewayResult<&[u8]> {
        match self.request()? {
            Some(request) => Ok(request.body(self.payload)),
            None => Ok(self.payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAction {
    /// Send these bytes back on the same socket.
    Respond(Vec<u8>),
    /// Send, then close the socket.
    RespondAndClose(Vec<u8>),
    /// Send and keep the socket waiting for more from this backend.
    Stream(Vec<u8>),
    Close,
    Ignore,
}

pub trait BackendApp: Send + Sync {
    fn name(&self) -> &str;

    fn on_message(&self, message: &BackendMessage<'_>) -> BackendAction;

    /// The gateway closed a socket this backend had seen.
    fn on_disconnect(&self, _session: Session) {}
}

/// Complete HTTP/1.1 response with `Date` and `Content-Length`.
pub fn http_response(status: u16, reason: &str, content_type: &str, body: &[u8], keep_alive: bool) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(160 + body.len());
    out.put_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    out.put_slice(b"Server: nexgate\r\n");
    out.put_slice(format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())).as_bytes());
    out.put_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    if !keep_alive {
        out.put_slice(b"Connection: close\r\n");
    }
    out.put_slice(b"\r\n");
    out.put_slice(body);
    out.to_vec()
}

/// Answers every message with its own body.
pub struct EchoApp;

impl BackendApp for EchoApp {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_message(&self, message: &BackendMessage<'_>) -> BackendAction {
        match message.op {
            ChunkOp::HttpRequest => match message.body() {
                Ok(body) => BackendAction::Respond(http_response(
                    200,
                    "OK",
                    "application/octet-stream",
                    body,
                    message.keep_alive(),
                )),
                Err(_) => BackendAction::RespondAndClose(http_response(400, "Bad Request", "text/plain", b"", false)),
            },
            _ => BackendAction::Respond(message.payload.to_vec()),
        }
    }
}

/// A running backend. `stop` or dropping the handle takes it out of service.
pub struct BackendHandle {
    id: BackendId,
    name: String,
    gateway: Arc<Gateway>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl BackendHandle {
    /// Registers `app` and starts its schedulers.
    pub fn start(gateway: &Arc<Gateway>, app: Arc<dyn BackendApp>) -> GatewayResult<BackendHandle> {
        let name = app.name().to_string();
        let id = gateway.register_backend(&name)?;
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(gateway.schedulers());
        for index in 0..gateway.schedulers() {
            let scheduler = Scheduler::new(id, index, gateway.clone(), app.clone(), stop.clone());
            let spawned = thread::Builder::new()
                .name(format!("Nexgate-db-{}-{}", name, index))
                .spawn(move || scheduler.run());
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    let mut partial = BackendHandle {
                        id,
                        name,
                        gateway: gateway.clone(),
                        stop,
                        threads,
                    };
                    partial.halt()?;
                    return Err(err.into());
                }
            }
        }
        Ok(BackendHandle {
            id,
            name,
            gateway: gateway.clone(),
            stop,
            threads,
        })
    }

    #[inline(always)]
    pub fn id(&self) -> BackendId {
        self.id
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the schedulers, then unregisters the backend so every bound
    /// socket gets closed.
    pub fn stop(mut self) -> GatewayResult<()> {
        self.halt()
    }

    fn halt(&mut self) -> GatewayResult<()> {
        if self.stop.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for index in 0..self.threads.len() {
            self.gateway.backend_signal(self.id, index).wake();
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("Backend {}: a scheduler thread panicked", self.name);
            }
        }
        match self.gateway.unregister_backend(self.id) {
            Err(GatewayError::BackendNotFound(_)) => Ok(()),
            other => other,
        }
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        if let Err(err) = self.halt() {
            warn!("Backend {}: {}", self.name, err);
        }
    }
}

struct Scheduler {
    backend: BackendId,
    index: usize,
    gateway: Arc<Gateway>,
    app: Arc<dyn BackendApp>,
    pool: PrivateChunkPool,
    /// Replies the worker channel had no room for, with their worker.
    pending: VecDeque<(u8, ChunkChain)>,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    fn new(
        backend: BackendId,
        index: usize,
        gateway: Arc<Gateway>,
        app: Arc<dyn BackendApp>,
        stop: Arc<AtomicBool>,
    ) -> Scheduler {
        let config = gateway.config();
        let pool = PrivateChunkPool::new(
            gateway.shared_pool().clone(),
            config.private_pool_chunks,
            config.private_pool_high_water(),
            Duration::from_millis(config.shared_pool_timeout_ms),
        );
        Scheduler {
            backend,
            index,
            gateway,
            app,
            pool,
            pending: VecDeque::new(),
            stop,
        }
    }

    fn running(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !self.gateway.is_shutdown()
    }

    fn run(mut self) {
        debug!("Backend {} scheduler {} started", self.backend, self.index);
        while self.running() {
            self.flush_pending();
            let popped = self.drain_workers();
            if popped == 0 {
                let wait = match self.pending.is_empty() {
                    true => IDLE_WAIT,
                    false => RETRY_WAIT,
                };
                self.gateway.backend_signal(self.backend, self.index).wait_timeout(wait);
            }
        }
        for (_, chain) in self.pending.drain(..) {
            self.pool.release(chain);
        }
        self.pool.drain_to_shared();
        info!("Backend {} scheduler {} stopped", self.backend, self.index);
    }

    fn drain_workers(&mut self) -> usize {
        let mut popped = 0;
        for worker in 0..self.gateway.workers() as u8 {
            for _ in 0..MAX_POPS_PER_WORKER {
                let next = self
                    .gateway
                    .channel(worker, self.backend, self.index)
                    .to_backend
                    .try_pop();
                let Some(chain) = next else {
                    break;
                };
                popped += 1;
                self.handle(worker, chain);
            }
        }
        popped
    }

    fn handle(&mut self, worker: u8, chain: ChunkChain) {
        let header = chain.header(self.pool.arena());
        let payload = chain.read_payload(self.pool.arena());
        self.pool.release(chain);
        let session = Session {
            salt: header.salt,
            slot: header.slot,
            worker,
        };
        if header.op == ChunkOp::Disconnect {
            self.app.on_disconnect(session);
            return;
        }
        let message = BackendMessage {
            op: header.op,
            session,
            port: header.port,
            handler: header.handler,
            flags: header.flags,
            payload: &payload,
        };
        let reply_op = match header.op {
            ChunkOp::WsFrame => ChunkOp::WsFrame,
            ChunkOp::RawData => ChunkOp::RawData,
            _ => ChunkOp::HttpResponse,
        };
        let text = header.flags & ChunkFlags::WS_TEXT;
        let (op, flags, body) = match self.app.on_message(&message) {
            BackendAction::Respond(body) => (reply_op, text, body),
            BackendAction::Stream(body) => (reply_op, text | ChunkFlags::STREAMING, body),
            BackendAction::RespondAndClose(body) => (ChunkOp::SendAndDisconnect, text, body),
            BackendAction::Close => (ChunkOp::Disconnect, ChunkFlags::empty(), Vec::new()),
            BackendAction::Ignore => return,
        };
        let needed = body.len().div_ceil(self.pool.arena().payload_size()).max(1);
        let mut reply = match self.pool.acquire(needed) {
            Ok(chain) => chain,
            Err(err) => {
                warn!("Backend {}: reply for {} dropped: {}", self.backend, session, err);
                return;
            }
        };
        reply.write_at(self.pool.arena(), 0, &body);
        let reply_header = ChunkHeader {
            op,
            direction: Direction::FromBackend,
            handler: header.handler,
            salt: header.salt,
            slot: header.slot,
            total_len: body.len() as u32,
            worker,
            backend: self.backend,
            flags,
            port: header.port,
            stamp: header.stamp,
            ..ChunkHeader::default()
        };
        reply.set_header(self.pool.arena(), &reply_header);
        trace!("Backend {}: {:?} of {} bytes for {}", self.backend, op, body.len(), session);
        self.push(worker, reply);
    }

    /// Keeps per-worker order: once something is pending, later replies queue behind it.
    fn push(&mut self, worker: u8, chain: ChunkChain) {
        if self.pending.iter().any(|(w, _)| *w == worker) {
            self.pending.push_back((worker, chain));
            return;
        }
        let channel = &self.gateway.channel(worker, self.backend, self.index).from_backend;
        if let Err(chain) = channel.try_push(chain) {
            self.pending.push_back((worker, chain));
        }
    }

    fn flush_pending(&mut self) {
        let mut blocked = [false; u8::MAX as usize + 1];
        for _ in 0..self.pending.len() {
            let Some((worker, chain)) = self.pending.pop_front() else {
                break;
            };
            if blocked[worker as usize] {
                self.pending.push_back((worker, chain));
                continue;
            }
            let channel = &self.gateway.channel(worker, self.backend, self.index).from_backend;
            if let Err(chain) = channel.try_push(chain) {
                blocked[worker as usize] = true;
                self.pending.push_back((worker, chain));
            }
        }
    }
}
