#![allow(dead_code)]

use nexgate::library::{
    config::{GatewayConfig, PortConfig},
    gateway::Gateway,
    worker::{
        Worker,
        driver::{IoDriver, IoEvent, IoOp, Token},
    },
};
use std::{
    collections::{HashMap, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    os::fd::RawFd,
    sync::Arc,
    time::{Duration, Instant},
};

pub const PORT: u16 = 8080;
pub const RAW_PORT: u16 = 9000;

#[derive(Default)]
struct Conn {
    inbound: VecDeque<u8>,
    /// Largest read handed out at once; 0 means unlimited.
    fragment: usize,
    output: Vec<u8>,
    closed: bool,
    peer_closed: bool,
}

struct PendingRecv {
    token: Token,
    iovecs: Vec<libc::iovec>,
}

/// In-memory stand-in for the kernel ring. Reads are served from per-fd
/// inbound queues, sends are captured, nothing ever blocks.
#[derive(Default)]
pub struct ScriptedDriver {
    accepts: VecDeque<(u16, RawFd, Option<IpAddr>)>,
    conns: HashMap<RawFd, Conn>,
    recvs: HashMap<RawFd, PendingRecv>,
    ready: VecDeque<IoEvent>,
    next_fd: RawFd,
    /// Completions held back for one more `wait`.
    deferred: VecDeque<IoEvent>,
    /// Caps every send completion; 0 means the whole buffer goes out.
    pub send_limit: usize,
    pub closed_fds: Vec<RawFd>,
    /// Outbound sockets in the order they were connected.
    pub connects: Vec<(RawFd, SocketAddr)>,
    /// Destinations that answer a connect with ECONNREFUSED.
    pub refused: Vec<SocketAddr>,
    /// A read cut short by close completes one `wait` late, like a ring
    /// that reaps the cancelled read after the close.
    pub late_cancel: bool,
}

impl ScriptedDriver {
    pub fn new() -> ScriptedDriver {
        ScriptedDriver {
            next_fd: 1000,
            ..ScriptedDriver::default()
        }
    }

    pub fn connect(&mut self, port: u16) -> RawFd {
        self.connect_from(port, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }

    pub fn connect_from(&mut self, port: u16, peer: Option<IpAddr>) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.conns.insert(fd, Conn::default());
        self.accepts.push_back((port, fd, peer));
        fd
    }

    pub fn feed(&mut self, fd: RawFd, bytes: &[u8]) {
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.inbound.extend(bytes.iter().copied());
        }
    }

    pub fn set_fragment(&mut self, fd: RawFd, fragment: usize) {
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.fragment = fragment;
        }
    }

    /// The peer closes its side.
    pub fn hangup(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.peer_closed = true;
        }
    }

    pub fn take_output(&mut self, fd: RawFd) -> Vec<u8> {
        self.conns
            .get_mut(&fd)
            .map(|conn| std::mem::take(&mut conn.output))
            .unwrap_or_default()
    }

    pub fn is_closed(&self, fd: RawFd) -> bool {
        self.conns.get(&fd).is_none_or(|conn| conn.closed)
    }

    pub fn has_pending_recv(&self, fd: RawFd) -> bool {
        self.recvs.contains_key(&fd)
    }

    /// Completions not yet handed to the worker.
    pub fn undelivered(&self) -> usize {
        self.ready.len() + self.deferred.len()
    }

    /// The outbound socket opened towards `addr`, if any.
    pub fn connected_to(&self, addr: SocketAddr) -> Option<RawFd> {
        self.connects.iter().find(|(_, to)| *to == addr).map(|(fd, _)| *fd)
    }

    fn serve_recvs(&mut self) {
        let mut fds: Vec<RawFd> = self.recvs.keys().copied().collect();
        fds.sort_unstable();
        for fd in fds {
            let Some(conn) = self.conns.get_mut(&fd) else {
                continue;
            };
            let result = if !conn.inbound.is_empty() {
                let Some(pending) = self.recvs.get(&fd) else {
                    continue;
                };
                let mut budget = match conn.fragment {
                    0 => usize::MAX,
                    n => n,
                };
                let mut copied = 0usize;
                for iov in pending.iovecs.iter() {
                    let take = iov.iov_len.min(budget).min(conn.inbound.len());
                    for i in 0..take {
                        let byte = conn.inbound.pop_front().unwrap_or(0);
                        // SAFETY: the worker keeps the receive buffers alive until completion.
                        unsafe { *(iov.iov_base as *mut u8).add(i) = byte };
                    }
                    copied += take;
                    budget -= take;
                    if budget == 0 || conn.inbound.is_empty() {
                        break;
                    }
                }
                copied as i32
            } else if conn.peer_closed || conn.closed {
                0
            } else {
                continue;
            };
            if let Some(pending) = self.recvs.remove(&fd) {
                self.ready.push_back(IoEvent::Completed {
                    token: pending.token,
                    op: IoOp::Recv,
                    result,
                });
            }
        }
    }
}

impl IoDriver for ScriptedDriver {
    unsafe fn submit_recv(&mut self, token: Token, fd: RawFd, iovecs: &[libc::iovec]) -> io::Result<()> {
        assert!(!self.recvs.contains_key(&fd), "second receive armed on fd {}", fd);
        self.recvs.insert(
            fd,
            PendingRecv {
                token,
                iovecs: iovecs.to_vec(),
            },
        );
        Ok(())
    }

    unsafe fn submit_send(&mut self, token: Token, fd: RawFd, iovecs: &[libc::iovec]) -> io::Result<()> {
        let mut limit = match self.send_limit {
            0 => usize::MAX,
            n => n,
        };
        let mut sent = 0usize;
        let conn = self.conns.entry(fd).or_default();
        for iov in iovecs {
            let take = iov.iov_len.min(limit);
            // SAFETY: the worker keeps the send buffers alive until completion.
            let bytes = unsafe { std::slice::from_raw_parts(iov.iov_base as *const u8, take) };
            conn.output.extend_from_slice(bytes);
            sent += take;
            limit -= take;
            if limit == 0 {
                break;
            }
        }
        self.ready.push_back(IoEvent::Completed {
            token,
            op: IoOp::Send,
            result: sent as i32,
        });
        Ok(())
    }

    fn submit_close(&mut self, token: Token, fd: RawFd) -> io::Result<()> {
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.closed = true;
        }
        self.closed_fds.push(fd);
        if let Some(pending) = self.recvs.remove(&fd) {
            let cancelled = IoEvent::Completed {
                token: pending.token,
                op: IoOp::Recv,
                result: -libc::ECANCELED,
            };
            match self.late_cancel {
                true => self.deferred.push_back(cancelled),
                false => self.ready.push_back(cancelled),
            }
        }
        self.ready.push_back(IoEvent::Completed {
            token,
            op: IoOp::Close,
            result: 0,
        });
        Ok(())
    }

    fn open_stream(&mut self, addr: SocketAddr) -> io::Result<RawFd> {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.conns.insert(fd, Conn::default());
        self.connects.push((fd, addr));
        Ok(fd)
    }

    fn submit_connect(&mut self, token: Token, _fd: RawFd, addr: SocketAddr) -> io::Result<()> {
        let result = match self.refused.contains(&addr) {
            true => -libc::ECONNREFUSED,
            false => 0,
        };
        self.ready.push_back(IoEvent::Completed {
            token,
            op: IoOp::Connect,
            result,
        });
        Ok(())
    }

    fn wait(&mut self, _timeout: Duration, events: &mut Vec<IoEvent>) -> io::Result<()> {
        while let Some((port, fd, peer)) = self.accepts.pop_front() {
            events.push(IoEvent::Accepted { port, fd, peer });
        }
        self.serve_recvs();
        events.extend(self.ready.drain(..));
        self.ready.extend(self.deferred.drain(..));
        Ok(())
    }
}

pub fn config() -> GatewayConfig {
    GatewayConfig {
        workers: 1,
        chunk_size: 512,
        total_chunks: 512,
        private_pool_chunks: 16,
        max_chunks_per_request: 64,
        channel_capacity: 16,
        idle_wait_ms: 1,
        handoff_threshold: 0,
        ports: vec![PortConfig {
            port: PORT,
            ..PortConfig::default()
        }],
        ..GatewayConfig::default()
    }
}

pub fn worker(config: GatewayConfig) -> (Arc<Gateway>, Worker<ScriptedDriver>) {
    let gateway = Gateway::new(config).expect("gateway");
    let worker = Worker::new(0, gateway.clone(), ScriptedDriver::new());
    (gateway, worker)
}

pub fn spin(worker: &mut Worker<ScriptedDriver>, turns: usize) {
    for _ in 0..turns {
        worker.turn().expect("turn");
    }
}

/// Turns until `fd` produced output or `turns` ran out.
pub fn output_after(worker: &mut Worker<ScriptedDriver>, fd: RawFd, turns: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..turns {
        worker.turn().expect("turn");
        out.extend(worker.driver_mut().take_output(fd));
    }
    out
}

/// Turns until the output collected from `fd` satisfies `done`, for
/// replies that come back from backend threads. Gives up after five seconds.
pub fn output_until(worker: &mut Worker<ScriptedDriver>, fd: RawFd, done: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut out = Vec::new();
    while Instant::now() < deadline {
        worker.turn().expect("turn");
        out.extend(worker.driver_mut().take_output(fd));
        if done(&out) {
            break;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    out
}

/// Turns until `cond` holds or five seconds passed. Returns `cond`'s last value.
pub fn turn_until(worker: &mut Worker<ScriptedDriver>, cond: impl Fn(&Worker<ScriptedDriver>) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        worker.turn().expect("turn");
        if cond(worker) {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    cond(worker)
}

pub fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
