//! Per-core event loop.
//!
//! A worker owns its sockets outright: accept, receive, parse, dispatch and
//! send all happen on its thread against its own [`SocketDataUnit`]s and its
//! own private chunk pool. It only talks to the rest of the process through
//! the gateway's channels, socket table, registry and note queues.

pub mod driver;
pub mod overflow;

use crate::library::{
    chunk::{ChunkChain, ChunkFlags, ChunkHeader, ChunkOp, Direction, pool::PrivateChunkPool},
    config::{MAX_ACTIVE_BACKENDS, Scheduling},
    error::{ErrorKind, GatewayError, GatewayResult},
    gateway::{Gateway, WorkerNote},
    handlers::{Action, BackendId, GATEWAY_BACKEND, HandlerContext, HandlerId, MessageView, port::PortMode, registry::Registry},
    protocol::{
        http::HttpRequest,
        responses,
        ws::{self, FrameHeader, FramePart, Opcode},
    },
    session::{Protocol, Session, SocketFlags, SocketInfo},
    socket_data::{Message, MessageKind, SocketDataUnit, UnitFlags, UnitState},
    stats::{WorkerReport, bump},
};
use bytes::BytesMut;
use driver::{IoDriver, IoEvent, IoOp, Token};
use overflow::OverflowQueue;
use stable_vec::ExternStableVec;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    os::fd::RawFd,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

/// Token for operations that do not belong to a unit.
const NO_UNIT: u32 = u32::MAX;
/// Per channel and loop iteration, so one busy backend cannot starve the sockets.
const MAX_POPS_PER_CHANNEL: usize = 64;
/// Sub-port id prefix of raw messages.
const SUBPORT_ID_LEN: usize = 4;
/// Waits shutdown spends on in-flight reads and sends before giving up.
const SHUTDOWN_ROUNDS: usize = 200;
const SHUTDOWN_WAIT: Duration = Duration::from_millis(5);

/// Where a message's handler lists come from.
#[derive(Debug, Clone, Copy)]
enum Route {
    Uri,
    Port,
    SubPort(u32),
    /// The list an upgraded socket was bound to.
    Bound(BackendId, HandlerId),
}

pub struct Worker<D: IoDriver> {
    id: u8,
    gateway: Arc<Gateway>,
    driver: D,
    pool: PrivateChunkPool,
    units: ExternStableVec<SocketDataUnit>,
    free_units: Vec<usize>,
    /// Stamp last used for each unit index.
    stamps: Vec<u16>,
    by_slot: HashMap<u32, usize>,
    overflow: OverflowQueue,
    events: Vec<IoEvent>,
    rr_cursor: [usize; MAX_ACTIVE_BACKENDS],
    drain_cursor: usize,
    last_housekeeping: u64,
    last_report: WorkerReport,
}

impl<D: IoDriver> Worker<D> {
    pub fn new(id: u8, gateway: Arc<Gateway>, driver: D) -> Worker<D> {
        let config = gateway.config();
        let pool = PrivateChunkPool::new(
            gateway.shared_pool().clone(),
            config.private_pool_chunks,
            config.private_pool_high_water(),
            Duration::from_millis(config.shared_pool_timeout_ms),
        );
        let overflow = OverflowQueue::new(gateway.channels_per_worker());
        let last_report = gateway.worker_stats(id).snapshot(id);
        Worker {
            id,
            driver,
            pool,
            units: ExternStableVec::with_capacity(1024),
            free_units: Vec::new(),
            stamps: Vec::new(),
            by_slot: HashMap::new(),
            overflow,
            events: Vec::with_capacity(256),
            rr_cursor: [0; MAX_ACTIVE_BACKENDS],
            drain_cursor: 0,
            last_housekeeping: 0,
            last_report,
            gateway,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[inline(always)]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[inline(always)]
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Live units, closing ones included.
    #[inline(always)]
    pub fn active_units(&self) -> usize {
        self.units.num_elements()
    }

    #[inline(always)]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Loops until the gateway shuts down.
    pub fn run(&mut self) -> GatewayResult<()> {
        self.gateway.global_lock().worker_started();
        info!("Worker {} started", self.id);
        let result = loop {
            if self.gateway.is_shutdown() {
                break Ok(());
            }
            if let Err(err) = self.turn() {
                error!("Worker {} stopped on error: {}", self.id, err);
                break Err(err);
            }
        };
        self.shutdown();
        self.gateway.global_lock().worker_stopped();
        info!("Worker {} stopped", self.id);
        result
    }

    /// One loop iteration.
    pub fn turn(&mut self) -> GatewayResult<()> {
        self.gateway.global_lock().safe_point();

        let mut events = std::mem::take(&mut self.events);
        for event in events.drain(..) {
            self.on_event(event);
        }
        self.events = events;

        let popped = self.drain_backend_channels();
        self.flush_overflow();
        self.drain_notes();
        self.housekeeping();

        let timeout = if popped > 0 || self.gateway.worker_wake(self.id).is_pending() {
            Duration::ZERO
        } else if !self.overflow.is_empty() {
            Duration::from_millis(1)
        } else {
            Duration::from_millis(self.gateway.config().idle_wait_ms)
        };
        self.driver.wait(timeout, &mut self.events)?;
        Ok(())
    }

    fn on_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Accepted { port, fd, peer } => self.on_accept(port, fd, peer),
            IoEvent::Woken => {
                self.gateway.worker_wake(self.id).take();
            }
            IoEvent::Completed { token, op, result } => {
                if token.unit == NO_UNIT {
                    return;
                }
                let Some(index) = self.unit_index(token) else {
                    trace!("Worker {}: dropping late {:?} completion for {:?}", self.id, op, token);
                    return;
                };
                match op {
                    IoOp::Recv => self.on_recv(index, result),
                    IoOp::Send => self.on_send(index, result),
                    IoOp::Close => self.on_closed(index),
                    IoOp::Connect => self.on_connect(index, result),
                }
            }
        }
    }

    fn unit_index(&self, token: Token) -> Option<usize> {
        let index = token.unit as usize;
        self.units
            .get(index)
            .filter(|unit| unit.stamp() == token.stamp)
            .map(|_| index)
    }

    #[inline(always)]
    fn token(index: usize, unit: &SocketDataUnit) -> Token {
        Token {
            unit: index as u32,
            stamp: unit.stamp(),
        }
    }

    fn close_fd(&mut self, fd: RawFd) {
        let token = Token { unit: NO_UNIT, stamp: 0 };
        if let Err(err) = self.driver.submit_close(token, fd) {
            warn!("Worker {}: close of fd {} failed: {}", self.id, fd, err);
        }
    }

    fn on_accept(&mut self, port: u16, fd: RawFd, peer: Option<IpAddr>) {
        if !self.gateway.is_whitelisted(peer) {
            debug!("Worker {}: {:?} is not whitelisted on port {}", self.id, peer, port);
            bump(&self.gateway.worker_stats(self.id).rejected, 1);
            self.close_fd(fd);
            return;
        }
        if let Some(target) = self.handoff_target(port) {
            debug!("Worker {}: handing fd {} over to worker {}", self.id, fd, target);
            self.gateway.post(target, WorkerNote::Adopt { fd, port, peer });
            return;
        }
        self.adopt(fd, port);
    }

    /// A less loaded worker, if this one is ahead by the handoff threshold.
    fn handoff_target(&self, port: u16) -> Option<u8> {
        let threshold = self.gateway.config().handoff_threshold;
        let workers = self.gateway.workers();
        if threshold == 0 || workers < 2 {
            return None;
        }
        let registry = self.gateway.registry();
        let state = registry.port(port)?;
        let target = state.least_busy_worker(workers);
        let (mine, theirs) = (state.active_sockets(self.id), state.active_sockets(target));
        (target != self.id && mine >= theirs + threshold).then_some(target)
    }

    fn adopt(&mut self, fd: RawFd, port: u16) {
        let now = self.gateway.now_secs();
        let session = match self.gateway.sessions().allocate(fd, port, self.id, now) {
            Ok(session) => session,
            Err(err) => {
                warn!("Worker {}: dropping fd {} on port {}: {}", self.id, fd, port, err);
                self.close_fd(fd);
                return;
            }
        };
        let protocol = {
            let registry = self.gateway.registry();
            let state = registry.port(port);
            if let Some(state) = state {
                state.socket_opened(self.id);
            }
            match state.map(|s| s.mode()) {
                Some(PortMode::SubPorts | PortMode::Raw) => Protocol::Raw,
                _ => Protocol::Http1,
            }
        };
        if let Err(err) = self.gateway.sessions().update(&session, |info| info.protocol = protocol) {
            trace!("Worker {}: {} gone before adoption finished: {}", self.id, session, err);
        }
        let index = self.insert_unit(fd, port, session, protocol);
        bump(&self.gateway.worker_stats(self.id).accepted, 1);
        trace!("Worker {}: fd {} on port {} is unit {} ({})", self.id, fd, port, index, session);
        if let Some(unit) = self.units.get_mut(index) {
            unit.set_state(UnitState::Receiving);
        }
        self.start_recv(index);
    }

    /// Places a new unit in a free index, bumping that index's stamp.
    fn insert_unit(&mut self, fd: RawFd, port: u16, session: Session, protocol: Protocol) -> usize {
        let unit_of = |stamp: u16| SocketDataUnit::new(fd, port, session, stamp, protocol);
        let index = match self.free_units.pop() {
            Some(index) => {
                let stamp = self.stamps[index].wrapping_add(1);
                self.stamps[index] = stamp;
                self.units.insert(index, unit_of(stamp));
                index
            }
            None => {
                let index = self.units.push(unit_of(0));
                self.stamps.push(0);
                index
            }
        };
        self.by_slot.insert(session.slot, index);
        index
    }

    /// Keeps exactly one receive armed while the unit is open.
    fn start_recv(&mut self, index: usize) {
        let max_chunks = self.gateway.config().max_chunks_per_request;
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        if unit
            .flags()
            .intersects(UnitFlags::RECV_PENDING | UnitFlags::CLOSE_PENDING | UnitFlags::CLOSE_AFTER_SEND)
            || unit.state() == UnitState::Connecting
            || http_busy(unit)
        {
            return;
        }
        let (token, fd) = (Self::token(index, unit), unit.fd());
        let submitted = match unit.prepare_recv(&mut self.pool, max_chunks) {
            // SAFETY: the descriptors point into chunks and a vector the unit
            // keeps until the completion clears RECV_PENDING.
            Ok(iovecs) => unsafe { self.driver.submit_recv(token, fd, iovecs) }.map_err(GatewayError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = submitted {
            if let Some(unit) = self.units.get_mut(index) {
                unit.set_flag(UnitFlags::RECV_PENDING, false);
            }
            self.fail_unit(index, err);
        }
    }

    fn on_recv(&mut self, index: usize, result: i32) {
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        if result <= 0 {
            unit.advance(0);
            if unit.flags().contains(UnitFlags::CLOSE_PENDING) {
                self.maybe_remove(index);
                return;
            }
            match result {
                0 => trace!("Worker {}: peer closed {}", self.id, unit.session()),
                errno => debug!("Worker {}: receive on {} failed: errno {}", self.id, unit.session(), -errno),
            }
            self.disconnect(index);
            return;
        }
        unit.advance(result as usize);
        if unit.flags().contains(UnitFlags::CLOSE_PENDING) {
            self.maybe_remove(index);
            return;
        }
        let session = unit.session();
        let stats = self.gateway.worker_stats(self.id);
        bump(&stats.bytes_received, result as u64);
        bump(&stats.packets_received, 1);
        self.gateway.sessions().touch(&session, self.gateway.now_secs());

        self.process_input(index);
        self.start_recv(index);
    }

    /// Dispatches every complete message sitting in the unit's buffer.
    fn process_input(&mut self, index: usize) {
        let max_chunks = self.gateway.config().max_chunks_per_request;
        loop {
            let Some(unit) = self.units.get_mut(index) else {
                return;
            };
            // The buffer cannot be reshaped under a receive still writing into it.
            if unit
                .flags()
                .intersects(UnitFlags::RECV_PENDING | UnitFlags::CLOSE_PENDING | UnitFlags::CLOSE_AFTER_SEND)
                || http_busy(unit)
            {
                return;
            }
            let message = match unit.poll_message(self.pool.arena(), max_chunks) {
                Ok(Some(message)) => message,
                Ok(None) => return,
                Err(err) => {
                    self.fail_unit(index, err);
                    return;
                }
            };
            if !self.dispatch(index, message) {
                return;
            }
        }
    }

    /// Returns false when the message needs more bytes before it can be routed.
    fn dispatch(&mut self, index: usize, message: Message) -> bool {
        let Some(unit) = self.units.get_mut(index) else {
            return false;
        };
        if unit.protocol() == Protocol::Relay {
            return self.relay(index, message.len);
        }
        let route = match &message.kind {
            MessageKind::Http(_) => Route::Uri,
            MessageKind::WsFrame(_) => match unit.bound() {
                Some((backend, id)) => Route::Bound(backend.unwrap_or(GATEWAY_BACKEND), id),
                None => Route::Port,
            },
            MessageKind::Raw => {
                let mode = self.gateway.registry().port(unit.port()).map(|p| p.mode());
                match mode {
                    Some(PortMode::SubPorts) => {
                        if message.len < SUBPORT_ID_LEN {
                            return false;
                        }
                        let mut raw = Vec::with_capacity(SUBPORT_ID_LEN);
                        unit.chain().copy_range(self.pool.arena(), 0, SUBPORT_ID_LEN, &mut raw);
                        let mut id = [0u8; SUBPORT_ID_LEN];
                        id.copy_from_slice(&raw);
                        Route::SubPort(u32::from_le_bytes(id))
                    }
                    _ => Route::Port,
                }
            }
        };
        unit.set_state(UnitState::Dispatching);
        let chain = match unit.take_message(&mut self.pool, message.len) {
            Ok(chain) => chain,
            Err(err) => {
                self.fail_unit(index, err);
                return false;
            }
        };
        match message.kind {
            MessageKind::Http(request) => {
                self.run_handlers(index, chain, route, Some(request), None, 0, message.len);
            }
            MessageKind::WsFrame(frame) => self.dispatch_frame(index, chain, route, frame),
            MessageKind::Raw => self.run_handlers(index, chain, route, None, None, 0, message.len),
        }
        true
    }

    fn dispatch_frame(&mut self, index: usize, mut chain: ChunkChain, route: Route, frame: FrameHeader) {
        let Some(key) = frame.mask else {
            self.pool.release(chain);
            self.fail_unit(index, GatewayError::MalformedWebSocket("unmasked client frame"));
            return;
        };
        let (start, end) = (frame.header_len, frame.frame_len());
        chain.for_each_mut(self.pool.arena(), start, end, |piece, offset| {
            ws::apply_mask(piece, key, offset)
        });
        match frame.opcode {
            Opcode::Ping | Opcode::Close => {
                let mut payload = Vec::with_capacity(frame.payload_len);
                chain.copy_range(self.pool.arena(), start, end, &mut payload);
                self.pool.release(chain);
                let Some(unit) = self.units.get_mut(index) else {
                    return;
                };
                let mut out = BytesMut::with_capacity(payload.len() + 2);
                if frame.opcode == Opcode::Ping {
                    ws::write_frame(&mut out, Opcode::Pong, FramePart::Single, &payload);
                } else {
                    if !unit.flags().contains(UnitFlags::WS_CLOSE_SENT) {
                        ws::write_frame(&mut out, Opcode::Close, FramePart::Single, &payload);
                        unit.set_flag(UnitFlags::WS_CLOSE_SENT, true);
                        if let Err(err) = self
                            .gateway
                            .sessions()
                            .update(&unit.session(), |info| info.flags |= SocketFlags::WS_CLOSE_SENT)
                        {
                            trace!("Worker {}: close flag for {} not recorded: {}", self.id, unit.session(), err);
                        }
                    }
                    unit.set_flag(UnitFlags::CLOSE_AFTER_SEND, true);
                }
                unit.queue_bytes(out);
                if unit.has_outgoing() {
                    self.start_send(index);
                } else {
                    self.disconnect(index);
                }
            }
            Opcode::Pong => self.pool.release(chain),
            _ => self.run_handlers(index, chain, route, None, Some(frame.opcode), start, frame.payload_len),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_handlers(
        &mut self,
        index: usize,
        chain: ChunkChain,
        route: Route,
        request: Option<HttpRequest>,
        frame: Option<Opcode>,
        start: usize,
        len: usize,
    ) {
        let Some(unit) = self.units.get(index) else {
            self.pool.release(chain);
            return;
        };
        let (port, session, protocol) = (unit.port(), unit.session(), unit.protocol());
        let gateway = self.gateway.clone();
        let mut reply = BytesMut::new();
        let outcome = {
            let registry = gateway.registry();
            let view = MessageView::new(gateway.shared_pool().arena(), &chain, start, len);
            let bound;
            let lists: &[(BackendId, HandlerId)] = match (route, registry.port(port)) {
                (Route::Bound(backend, id), _) => {
                    bound = [(backend, id)];
                    &bound
                }
                (_, None) => &[],
                (Route::Uri, Some(state)) => match request.as_ref() {
                    Some(request) => {
                        let uri = view.span(request.uri);
                        state.resolve_uri(request.method, &uri).map(|found| found.lists).unwrap_or(&[])
                    }
                    None => &[],
                },
                (Route::Port, Some(state)) => state.port_lists(),
                (Route::SubPort(subport), Some(state)) => state.subport_lists(subport).unwrap_or(&[]),
            };
            let mut ctx = HandlerContext::new(
                &gateway,
                self.id,
                port,
                session,
                protocol,
                request.as_ref(),
                frame,
                view,
                &mut reply,
            );
            run_lists(&registry, lists, &mut ctx).map(|handled| handled.map(|id| (id, ctx.action())))
        };
        match outcome {
            Ok(Some((id, action))) => {
                let keep_alive = request.as_ref().is_none_or(|r| r.keep_alive);
                let (op, mut flags) = match (&request, frame) {
                    (Some(_), _) => (ChunkOp::HttpRequest, ChunkFlags::empty()),
                    (None, Some(opcode)) => (
                        ChunkOp::WsFrame,
                        if opcode == Opcode::Text {
                            ChunkFlags::WS_TEXT
                        } else {
                            ChunkFlags::empty()
                        },
                    ),
                    (None, None) => (ChunkOp::RawData, ChunkFlags::empty()),
                };
                if keep_alive {
                    flags |= ChunkFlags::KEEP_ALIVE;
                }
                self.apply(index, chain, id, action, reply, op, flags, start, len);
            }
            Ok(None) => {
                self.pool.release(chain);
                self.fail_unit(index, GatewayError::NotHandled);
            }
            Err(err) => {
                self.pool.release(chain);
                self.fail_unit(index, err);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &mut self,
        index: usize,
        chain: ChunkChain,
        id: HandlerId,
        action: Action,
        reply: BytesMut,
        op: ChunkOp,
        flags: ChunkFlags,
        start: usize,
        len: usize,
    ) {
        match action {
            Action::Forward { backend } => {
                self.forward(index, chain, id, backend, op, flags, start, len);
                return;
            }
            Action::Proxy { destination } => {
                let chain = match start {
                    0 => chain,
                    _ => match self.repack(chain, start, len) {
                        Ok(chain) => chain,
                        Err(err) => {
                            self.fail_unit(index, err);
                            return;
                        }
                    },
                };
                self.start_proxy(index, chain, len, destination);
                return;
            }
            Action::Disconnect => {
                self.pool.release(chain);
                self.disconnect(index);
                return;
            }
            _ => self.pool.release(chain),
        }
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        match action {
            Action::Reply { close } => {
                unit.queue_bytes(reply);
                unit.set_flag(UnitFlags::CLOSE_AFTER_SEND, close);
            }
            Action::Upgrade { backend } => {
                unit.queue_bytes(reply);
                unit.set_protocol(Protocol::WebSocket);
                unit.bind(backend, id);
                let recorded = self.gateway.sessions().update(&unit.session(), |info| {
                    info.protocol = Protocol::WebSocket;
                    info.backend = backend;
                    info.ws_group = id.to_u32();
                });
                if let Err(err) = recorded {
                    trace!("Worker {}: upgrade of {} not recorded: {}", self.id, unit.session(), err);
                }
                debug!("Worker {}: {} upgraded to WebSocket via {:?}", self.id, unit.session(), id);
            }
            _ => unit.queue_bytes(reply),
        }
        if unit.has_outgoing() {
            self.start_send(index);
        } else if unit.flags().contains(UnitFlags::CLOSE_AFTER_SEND) {
            self.disconnect(index);
        } else {
            unit.set_state(UnitState::Receiving);
        }
    }

    /// Opens a connection to `destination` for the client at `index`. The
    /// request waits in the new unit's send queue until the connect completes.
    fn start_proxy(&mut self, index: usize, chain: ChunkChain, len: usize, destination: SocketAddr) {
        let Some(client) = self.units.get(index).map(|unit| Self::token(index, unit)) else {
            self.pool.release(chain);
            return;
        };
        let fd = match self.driver.open_stream(destination) {
            Ok(fd) => fd,
            Err(err) => {
                self.pool.release(chain);
                debug!("Worker {}: no socket for {}: {}", self.id, destination, err);
                self.refuse_proxy(index);
                return;
            }
        };
        let gateway = Arc::clone(&self.gateway);
        let sessions = gateway.sessions();
        let session = match sessions.allocate(fd, 0, self.id, gateway.now_secs()) {
            Ok(session) => session,
            Err(err) => {
                self.pool.release(chain);
                self.close_fd(fd);
                self.fail_unit(index, err);
                return;
            }
        };
        if let Err(err) = sessions.update(&session, |info| {
            info.protocol = Protocol::Relay;
            info.flags |= SocketFlags::PROXY_CONNECT;
        }) {
            trace!("Worker {}: proxy socket {} not recorded: {}", self.id, session, err);
        }
        let upstream = self.insert_unit(fd, 0, session, Protocol::Relay);
        let Some(unit) = self.units.get_mut(upstream) else {
            self.pool.release(chain);
            return;
        };
        unit.set_state(UnitState::Connecting);
        unit.pair(client);
        unit.queue_chain(chain, len, &mut self.pool);
        let token = Self::token(upstream, unit);
        if let Some(unit) = self.units.get_mut(index) {
            unit.pair(token);
            unit.set_state(UnitState::Receiving);
            if let Err(err) = sessions.update(&unit.session(), |info| info.protocol = Protocol::Relay) {
                trace!("Worker {}: relay of {} not recorded: {}", self.id, unit.session(), err);
            }
        }
        bump(&gateway.worker_stats(self.id).proxied, 1);
        debug!("Worker {}: connecting {} to {} for unit {}", self.id, session, destination, index);
        if let Err(err) = self.driver.submit_connect(token, fd, destination) {
            debug!("Worker {}: connect submission to {} failed: {}", self.id, destination, err);
            self.on_connect(upstream, -err.raw_os_error().unwrap_or(libc::EIO));
        }
    }

    fn on_connect(&mut self, index: usize, result: i32) {
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        if unit.flags().contains(UnitFlags::CLOSE_PENDING) {
            return;
        }
        if result < 0 {
            debug!("Worker {}: proxy connect of {} failed: errno {}", self.id, unit.session(), -result);
            if let Some(client) = unit.unpair()
                && let Some(client) = self.unit_index(client)
            {
                if let Some(unit) = self.units.get_mut(client) {
                    unit.unpair();
                }
                self.refuse_proxy(client);
            }
            self.disconnect(index);
            return;
        }
        unit.set_state(UnitState::Receiving);
        trace!("Worker {}: {} connected", self.id, unit.session());
        self.start_send(index);
        self.start_recv(index);
    }

    /// The proxied server cannot be reached: 502 and close.
    fn refuse_proxy(&mut self, index: usize) {
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        if unit.flags().contains(UnitFlags::CLOSE_PENDING) {
            return;
        }
        unit.queue_bytes(BytesMut::from(responses::BAD_GATEWAY));
        unit.set_flag(UnitFlags::CLOSE_AFTER_SEND, true);
        self.start_send(index);
    }

    /// Moves everything received on a relayed socket to its peer's send queue.
    fn relay(&mut self, index: usize, len: usize) -> bool {
        let Some(unit) = self.units.get_mut(index) else {
            return false;
        };
        let target = unit.peer().and_then(|peer| self.unit_index(peer));
        let Some(target) = target else {
            self.disconnect(index);
            return false;
        };
        let Some(unit) = self.units.get_mut(index) else {
            return false;
        };
        let chain = match unit.take_message(&mut self.pool, len) {
            Ok(chain) => chain,
            Err(err) => {
                self.fail_unit(index, err);
                return false;
            }
        };
        let Some(peer) = self
            .units
            .get_mut(target)
            .filter(|peer| !peer.flags().contains(UnitFlags::CLOSE_PENDING))
        else {
            self.pool.release(chain);
            self.disconnect(index);
            return false;
        };
        peer.queue_chain(chain, len, &mut self.pool);
        trace!("Worker {}: relayed {} bytes from unit {} to unit {}", self.id, len, index, target);
        self.start_send(target);
        true
    }

    /// The other half of a relay went away: flush what is owed, then close.
    fn orphan(&mut self, peer: Token) {
        let Some(index) = self.unit_index(peer) else {
            return;
        };
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        unit.unpair();
        if unit.flags().contains(UnitFlags::CLOSE_PENDING) {
            return;
        }
        if unit.state() == UnitState::Connecting || !unit.has_outgoing() {
            self.disconnect(index);
            return;
        }
        unit.set_flag(UnitFlags::CLOSE_AFTER_SEND, true);
        if let Err(err) = self
            .gateway
            .sessions()
            .update(&unit.session(), |info| info.flags |= SocketFlags::DISCONNECT_AFTER_SEND)
        {
            trace!("Worker {}: deferred close of {} not recorded: {}", self.id, unit.session(), err);
        }
        self.start_send(index);
    }

    /// Copies message bytes `start..start + len` into a chain of their own.
    fn repack(&mut self, chain: ChunkChain, start: usize, len: usize) -> GatewayResult<ChunkChain> {
        let mut bytes = Vec::with_capacity(len);
        chain.copy_range(self.pool.arena(), start, start + len, &mut bytes);
        self.pool.release(chain);
        let needed = len.div_ceil(self.pool.arena().payload_size()).max(1);
        let mut fresh = self.pool.acquire(needed)?;
        fresh.write_payload(self.pool.arena(), &bytes);
        Ok(fresh)
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &mut self,
        index: usize,
        chain: ChunkChain,
        id: HandlerId,
        backend: BackendId,
        op: ChunkOp,
        flags: ChunkFlags,
        start: usize,
        len: usize,
    ) {
        let mut chain = match start {
            0 => chain,
            _ => match self.repack(chain, start, len) {
                Ok(chain) => chain,
                Err(err) => {
                    self.fail_unit(index, err);
                    return;
                }
            },
        };
        let Some(unit) = self.units.get_mut(index) else {
            self.pool.release(chain);
            return;
        };
        let session = unit.session();
        let stamp = match self.gateway.sessions().update(&session, |info| {
            info.backend = Some(backend);
            info.flags.remove(SocketFlags::DISCONNECT_PUSHED_TO_BACKEND);
            info.stamp
        }) {
            Ok(stamp) => stamp,
            Err(err) => {
                self.pool.release(chain);
                self.fail_unit(index, err);
                return;
            }
        };
        let header = ChunkHeader {
            op,
            direction: Direction::ToBackend,
            handler: id.slot(),
            salt: session.salt,
            slot: session.slot,
            total_len: len as u32,
            worker: self.id,
            backend,
            flags,
            port: unit.port(),
            stamp,
            ..ChunkHeader::default()
        };
        chain.set_header(self.pool.arena(), &header);
        if op == ChunkOp::HttpRequest {
            unit.set_state(UnitState::ToBackend);
            if !flags.contains(ChunkFlags::KEEP_ALIVE) {
                unit.set_flag(UnitFlags::CLOSE_AFTER_SEND, true);
            }
        }
        let pinned = (op != ChunkOp::HttpRequest).then_some(session.slot as usize);
        self.push_to_backend(backend, pinned, chain);
        trace!("Worker {}: {} bytes of {} queued for backend {}", self.id, len, session, backend);
    }

    /// `pinned` keeps a connection's stream on one scheduler.
    fn push_to_backend(&mut self, backend: BackendId, pinned: Option<usize>, chain: ChunkChain) {
        let scheduler = self.pick_scheduler(backend, pinned);
        let channel_index = self.gateway.channel_index(backend, scheduler);
        let target = &self.gateway.worker_channel(self.id, channel_index).to_backend;
        let stats = self.gateway.worker_stats(self.id);
        if !self.overflow.push_or_queue(channel_index, target, chain) {
            bump(&stats.overflowed, 1);
        }
        bump(&stats.to_backend, 1);
    }

    fn pick_scheduler(&mut self, backend: BackendId, pinned: Option<usize>) -> usize {
        let schedulers = self.gateway.schedulers();
        if schedulers == 1 {
            return 0;
        }
        if let Some(key) = pinned {
            return key % schedulers;
        }
        match self.gateway.config().scheduling {
            Scheduling::RoundRobin => {
                let cursor = &mut self.rr_cursor[backend as usize];
                *cursor = (*cursor + 1) % schedulers;
                *cursor
            }
            Scheduling::LeastQueued => (0..schedulers)
                .min_by_key(|&scheduler| {
                    let at = self.gateway.channel_index(backend, scheduler);
                    self.gateway.worker_channel(self.id, at).to_backend.len() + self.overflow.queued_for(at)
                })
                .unwrap_or(0),
        }
    }

    fn flush_overflow(&mut self) {
        if self.overflow.is_empty() {
            return;
        }
        let (gateway, id) = (&self.gateway, self.id);
        let schedulers = gateway.schedulers();
        let pushed = self.overflow.flush(|at| {
            gateway
                .backend_active((at / schedulers) as BackendId)
                .then(|| &gateway.worker_channel(id, at).to_backend)
        });
        if pushed > 0 {
            trace!("Worker {}: {} chains left the overflow queue", self.id, pushed);
        }
    }

    fn drain_backend_channels(&mut self) -> usize {
        let per_worker = self.gateway.channels_per_worker();
        let schedulers = self.gateway.schedulers();
        let mut popped = 0;
        for step in 0..per_worker {
            let at = (self.drain_cursor + step) % per_worker;
            if !self.gateway.backend_active((at / schedulers) as BackendId) {
                continue;
            }
            for _ in 0..MAX_POPS_PER_CHANNEL {
                let Some(chain) = self.gateway.worker_channel(self.id, at).from_backend.try_pop() else {
                    break;
                };
                popped += 1;
                self.on_backend_chain(chain);
            }
        }
        self.drain_cursor = (self.drain_cursor + 1) % per_worker.max(1);
        popped
    }

    fn on_backend_chain(&mut self, chain: ChunkChain) {
        let header = chain.header(self.pool.arena());
        bump(&self.gateway.worker_stats(self.id).from_backend, 1);
        let sessions = self.gateway.sessions();
        if !sessions.validate(header.slot, header.salt) {
            debug!("Worker {}: reply for stale slot {} dropped", self.id, header.slot);
            self.pool.release(chain);
            return;
        }
        let live = self.by_slot.get(&header.slot).copied().filter(|&index| {
            self.units
                .get(index)
                .is_some_and(|unit| unit.session().salt == header.salt)
        });
        let Some(index) = live else {
            self.pool.release(chain);
            return;
        };
        let Some(unit) = self.units.get_mut(index) else {
            self.pool.release(chain);
            return;
        };
        if sessions.get(&unit.session()).is_none_or(|info| info.stamp != header.stamp) {
            debug!("Worker {}: reply for an earlier socket on slot {} dropped", self.id, header.slot);
            self.pool.release(chain);
            return;
        }
        if unit.flags().contains(UnitFlags::CLOSE_PENDING) {
            self.pool.release(chain);
            return;
        }
        let streaming = header.flags.contains(ChunkFlags::STREAMING);
        unit.set_flag(UnitFlags::STREAMING, streaming);
        if let Err(err) = sessions.update(&unit.session(), |info| info.flags.set(SocketFlags::STREAMING_RESPONSE, streaming)) {
            trace!("Worker {}: streaming flag for {} not recorded: {}", self.id, unit.session(), err);
        }
        match header.op {
            ChunkOp::HttpResponse | ChunkOp::RawData => {
                unit.queue_chain(chain, header.total_len as usize, &mut self.pool);
            }
            ChunkOp::SendAndDisconnect => {
                unit.queue_chain(chain, header.total_len as usize, &mut self.pool);
                unit.set_flag(UnitFlags::CLOSE_AFTER_SEND, true);
            }
            ChunkOp::WsFrame => {
                let payload = chain.read_payload(self.pool.arena());
                self.pool.release(chain);
                let opcode = match header.flags.contains(ChunkFlags::WS_TEXT) {
                    true => Opcode::Text,
                    false => Opcode::Binary,
                };
                let mut out = BytesMut::with_capacity(payload.len() + 10);
                ws::write_frame(&mut out, opcode, FramePart::Single, &payload);
                unit.queue_bytes(out);
            }
            ChunkOp::Disconnect => {
                self.pool.release(chain);
                self.disconnect(index);
                return;
            }
            other => {
                warn!("Worker {}: unexpected {:?} chunk from backend {}", self.id, other, header.backend);
                self.pool.release(chain);
                return;
            }
        }
        if unit.has_outgoing() {
            self.start_send(index);
        } else if unit.flags().contains(UnitFlags::CLOSE_AFTER_SEND) && !streaming {
            self.disconnect(index);
        }
    }

    fn start_send(&mut self, index: usize) {
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        if unit
            .flags()
            .intersects(UnitFlags::SEND_PENDING | UnitFlags::CLOSE_PENDING)
            || unit.state() == UnitState::Connecting
        {
            return;
        }
        if !unit.has_outgoing() {
            return;
        }
        let (token, fd) = (Self::token(index, unit), unit.fd());
        if unit.protocol() == Protocol::Http1 {
            unit.set_state(UnitState::Sending);
        }
        let Some(iovecs) = unit.prepare_send(self.pool.arena()) else {
            return;
        };
        // SAFETY: outgoing buffers stay queued in the unit until complete_send.
        if let Err(err) = unsafe { self.driver.submit_send(token, fd, iovecs) } {
            debug!("Worker {}: send submission failed: {}", self.id, err);
            unit.set_flag(UnitFlags::SEND_PENDING, false);
            self.disconnect(index);
        }
    }

    fn on_send(&mut self, index: usize, result: i32) {
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        if unit.flags().contains(UnitFlags::CLOSE_PENDING) {
            unit.complete_send(result.max(0) as usize, &mut self.pool);
            self.maybe_remove(index);
            return;
        }
        if result <= 0 {
            unit.set_flag(UnitFlags::SEND_PENDING, false);
            debug!("Worker {}: send on {} failed: {}", self.id, unit.session(), result);
            self.disconnect(index);
            return;
        }
        let stats = self.gateway.worker_stats(self.id);
        bump(&stats.bytes_sent, result as u64);
        bump(&stats.packets_sent, 1);
        if !unit.complete_send(result as usize, &mut self.pool) {
            self.start_send(index);
            return;
        }
        let flags = unit.flags();
        if flags.contains(UnitFlags::STREAMING) {
            unit.set_state(UnitState::ToBackend);
            return;
        }
        if flags.contains(UnitFlags::CLOSE_AFTER_SEND) {
            self.disconnect(index);
            return;
        }
        if unit.state() == UnitState::Sending {
            unit.set_state(UnitState::Receiving);
        }
        // Pipelined requests waited for this response.
        self.process_input(index);
        self.start_recv(index);
    }

    fn on_closed(&mut self, index: usize) {
        if let Some(unit) = self.units.get_mut(index) {
            unit.set_flag(UnitFlags::CLOSED, true);
        }
        self.maybe_remove(index);
    }

    /// Frees the unit once the close and every in-flight operation completed.
    fn maybe_remove(&mut self, index: usize) {
        let Some(unit) = self.units.get(index) else {
            return;
        };
        let flags = unit.flags();
        if !flags.contains(UnitFlags::CLOSE_PENDING | UnitFlags::CLOSED)
            || flags.intersects(UnitFlags::RECV_PENDING | UnitFlags::SEND_PENDING)
        {
            return;
        }
        if let Some(mut unit) = self.units.remove(index) {
            unit.release_all(&mut self.pool);
            self.free_units.push(index);
            trace!("Worker {}: unit {} freed", self.id, index);
        }
    }

    pub fn disconnect(&mut self, index: usize) {
        self.close_unit(index, None);
    }

    /// Releases the session (unless `released` says it already went), tells
    /// the bound backend, and closes the descriptor.
    fn close_unit(&mut self, index: usize, released: Option<SocketInfo>) {
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        if unit.flags().contains(UnitFlags::CLOSE_PENDING) {
            return;
        }
        unit.set_flag(UnitFlags::CLOSE_PENDING, true);
        unit.set_state(UnitState::Disconnecting);
        let peer = unit.unpair();
        let (session, port, fd, token) = (unit.session(), unit.port(), unit.fd(), Self::token(index, unit));
        if self.by_slot.get(&session.slot) == Some(&index) {
            self.by_slot.remove(&session.slot);
        }
        let info = released.or_else(|| self.gateway.sessions().release_session(&session));
        if let Some(info) = info
            && let Some(backend) = info.backend
            && !info.flags.contains(SocketFlags::DISCONNECT_PUSHED_TO_BACKEND)
            && self.gateway.backend_active(backend)
        {
            self.notify_disconnect(&info, backend);
        }
        if let Some(state) = self.gateway.registry().port(port) {
            state.socket_closed(self.id);
        }
        bump(&self.gateway.worker_stats(self.id).disconnected, 1);
        trace!("Worker {}: closing {} (fd {})", self.id, session, fd);
        if let Err(err) = self.driver.submit_close(token, fd) {
            warn!("Worker {}: close of fd {} failed: {}", self.id, fd, err);
            self.on_closed(index);
        }
        if let Some(peer) = peer {
            self.orphan(peer);
        }
    }

    fn notify_disconnect(&mut self, info: &SocketInfo, backend: BackendId) {
        let mut chain = match self.pool.acquire(1) {
            Ok(chain) => chain,
            Err(err) => {
                warn!("Worker {}: cannot tell backend {} about {}: {}", self.id, backend, info.session, err);
                return;
            }
        };
        let header = ChunkHeader {
            op: ChunkOp::Disconnect,
            direction: Direction::ToBackend,
            salt: info.session.salt,
            slot: info.session.slot,
            worker: self.id,
            backend,
            port: info.port,
            stamp: info.stamp,
            ..ChunkHeader::default()
        };
        chain.set_header(self.pool.arena(), &header);
        self.push_to_backend(backend, Some(info.session.slot as usize), chain);
    }

    /// Reacts to a failed unit according to the error's class.
    fn fail_unit(&mut self, index: usize, err: GatewayError) {
        let Some(unit) = self.units.get_mut(index) else {
            return;
        };
        if unit
            .flags()
            .intersects(UnitFlags::CLOSE_PENDING | UnitFlags::CLOSE_AFTER_SEND)
        {
            return;
        }
        let kind = err.kind();
        let reply: Option<&'static [u8]> = match (kind, unit.protocol()) {
            (ErrorKind::Exhaustion, Protocol::Http1) => Some(match err {
                GatewayError::PayloadTooLarge(_) => responses::TOO_LARGE,
                GatewayError::TooManyHeaders(_) => responses::BAD_REQUEST,
                _ => responses::SERVICE_UNAVAILABLE,
            }),
            (ErrorKind::Protocol, Protocol::Http1) => Some(responses::BAD_REQUEST),
            _ => None,
        };
        match kind {
            ErrorKind::Exhaustion => warn!("Worker {}: {} failed [{}]: {}", self.id, unit.session(), err.code(), err),
            _ => debug!("Worker {}: {} failed [{}]: {}", self.id, unit.session(), err.code(), err),
        }
        unit.set_state(UnitState::Error);
        if !unit.flags().contains(UnitFlags::RECV_PENDING) {
            unit.reset_input(&mut self.pool);
        }
        match reply {
            Some(bytes) => {
                unit.queue_bytes(BytesMut::from(bytes));
                unit.set_flag(UnitFlags::CLOSE_AFTER_SEND, true);
                self.start_send(index);
            }
            None => self.disconnect(index),
        }
    }

    fn drain_notes(&mut self) {
        while let Some(note) = self.gateway.take_note(self.id) {
            match note {
                WorkerNote::Adopt { fd, port, .. } => self.adopt(fd, port),
                WorkerNote::Disconnect(session) => {
                    let index = self.by_slot.get(&session.slot).copied();
                    if let Some(index) = index
                        && self.units.get(index).is_some_and(|unit| unit.session() == session)
                    {
                        self.disconnect(index);
                    }
                }
                WorkerNote::BackendGone(backend) => {
                    let mut dropped = 0;
                    for scheduler in 0..self.gateway.schedulers() {
                        let at = self.gateway.channel_index(backend, scheduler);
                        for chain in self.overflow.drain(at) {
                            self.pool.release(chain);
                            dropped += 1;
                        }
                    }
                    debug!("Worker {}: backend {} gone, {} queued chains dropped", self.id, backend, dropped);
                }
            }
        }
    }

    /// Once per second: inactive sweep and the stats line.
    fn housekeeping(&mut self) {
        let now = self.gateway.now_secs();
        if now == self.last_housekeeping {
            return;
        }
        self.last_housekeeping = now;

        let timeout = self.gateway.config().inactive_socket_timeout_secs;
        if timeout > 0 {
            let mut collected = Vec::new();
            self.gateway
                .sessions()
                .collect_inactive(self.id, now, timeout, |info| collected.push(info));
            for info in collected {
                let index = self.by_slot.get(&info.session.slot).copied();
                match index {
                    Some(index) if self.units.get(index).is_some_and(|u| u.session() == info.session) => {
                        self.close_unit(index, Some(info));
                    }
                    _ => self.close_fd(info.fd),
                }
            }
        }

        let report = self.gateway.worker_stats(self.id).snapshot(self.id);
        if report != self.last_report {
            let last = &self.last_report;
            info!(
                "Worker {}: {} units | rx {} B / {} msgs | tx {} B / {} msgs | backend out {} in {} | overflow {} | pool {}",
                self.id,
                self.units.num_elements(),
                report.bytes_received - last.bytes_received,
                report.packets_received - last.packets_received,
                report.bytes_sent - last.bytes_sent,
                report.packets_sent - last.packets_sent,
                report.to_backend - last.to_backend,
                report.from_backend - last.from_backend,
                self.overflow.len(),
                self.pool.len(),
            );
            self.last_report = report;
        }
    }

    /// Units with a receive or send still owned by the kernel.
    pub fn in_flight(&self) -> usize {
        self.units
            .iter()
            .filter(|(_, unit)| unit.flags().intersects(UnitFlags::RECV_PENDING | UnitFlags::SEND_PENDING))
            .count()
    }

    /// Closes every socket and hands all chunks back once the kernel is
    /// done with them.
    pub fn shutdown(&mut self) {
        while let Some(note) = self.gateway.take_note(self.id) {
            if let WorkerNote::Adopt { fd, .. } = note {
                self.close_fd(fd);
            }
        }
        let open: Vec<usize> = self.units.iter().map(|(index, _)| index).collect();
        for index in open {
            self.disconnect(index);
        }
        // The kernel may still write into receive chunks until their read completes.
        let mut rounds = 0;
        while self.in_flight() > 0 && rounds < SHUTDOWN_ROUNDS {
            rounds += 1;
            if let Err(err) = self.driver.wait(SHUTDOWN_WAIT, &mut self.events) {
                warn!("Worker {}: wait during shutdown: {}", self.id, err);
                break;
            }
            let mut events = std::mem::take(&mut self.events);
            for event in events.drain(..) {
                if let IoEvent::Accepted { fd, .. } = event {
                    self.close_fd(fd);
                } else {
                    self.on_event(event);
                }
            }
            self.events = events;
        }
        let left: Vec<usize> = self.units.iter().map(|(index, _)| index).collect();
        for index in left {
            let Some(mut unit) = self.units.remove(index) else {
                continue;
            };
            if unit.flags().intersects(UnitFlags::RECV_PENDING | UnitFlags::SEND_PENDING) {
                warn!("Worker {}: {} still has I/O in flight, its chunks are abandoned", self.id, unit.session());
                std::mem::forget(unit);
                continue;
            }
            unit.release_all(&mut self.pool);
        }
        self.free_units.clear();
        self.stamps.clear();
        self.by_slot.clear();
        self.overflow.release_all(&mut self.pool);
        self.pool.drain_to_shared();
    }
}

/// HTTP answers go out in request order, so a request waiting on a backend
/// or on its own reply holds back the next one.
#[inline(always)]
fn http_busy(unit: &SocketDataUnit) -> bool {
    unit.protocol() == Protocol::Http1 && (unit.state() == UnitState::ToBackend || unit.has_outgoing())
}

/// Runs `lists` in order until one reports handled.
fn run_lists(
    registry: &Registry,
    lists: &[(BackendId, HandlerId)],
    ctx: &mut HandlerContext<'_>,
) -> GatewayResult<Option<HandlerId>> {
    for &(_, id) in lists {
        if let Some(list) = registry.list(id)
            && list.run(ctx, id)?
        {
            return Ok(Some(id));
        }
    }
    Ok(None)
}
