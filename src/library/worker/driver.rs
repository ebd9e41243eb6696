use std::{
    io,
    net::{IpAddr, SocketAddr},
    os::fd::RawFd,
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoOp {
    Recv = 1,
    Send = 2,
    Close = 3,
    Connect = 4,
}

impl IoOp {
    pub fn from_u8(raw: u8) -> Option<IoOp> {
        match raw {
            1 => Some(IoOp::Recv),
            2 => Some(IoOp::Send),
            3 => Some(IoOp::Close),
            4 => Some(IoOp::Connect),
            _ => None,
        }
    }
}

/// Identifies the unit an operation belongs to. `stamp` changes whenever
/// the unit slot is reused, so late completions for a dead unit are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub unit: u32,
    pub stamp: u16,
}

#[derive(Debug)]
pub enum IoEvent {
    Accepted {
        port: u16,
        fd: RawFd,
        peer: Option<IpAddr>,
    },
    /// `result` is a byte count, or a negated errno.
    Completed { token: Token, op: IoOp, result: i32 },
    /// The worker's wake descriptor fired.
    Woken,
}

/// Completion-based I/O used by a worker.
///
/// Operations are submitted and later reported through [`IoDriver::wait`].
/// At most one receive and one send are in flight per unit.
pub trait IoDriver {
    /// # Safety
    /// The memory the descriptors point at, and the descriptor array itself,
    /// must stay valid and untouched until the completion is reported.
    unsafe fn submit_recv(&mut self, token: Token, fd: RawFd, iovecs: &[libc::iovec]) -> io::Result<()>;

    /// # Safety
    /// Same contract as [`IoDriver::submit_recv`].
    unsafe fn submit_send(&mut self, token: Token, fd: RawFd, iovecs: &[libc::iovec]) -> io::Result<()>;

    fn submit_close(&mut self, token: Token, fd: RawFd) -> io::Result<()>;

    /// A fresh stream socket for an outbound connection to `addr`.
    fn open_stream(&mut self, addr: SocketAddr) -> io::Result<RawFd>;

    /// Connects `fd` to `addr`. The driver keeps its own copy of the address
    /// until the completion, whose result is 0 or a negated errno.
    fn submit_connect(&mut self, token: Token, fd: RawFd, addr: SocketAddr) -> io::Result<()>;

    /// Flushes submissions and collects completions, sleeping up to
    /// `timeout` when none are ready.
    fn wait(&mut self, timeout: Duration, events: &mut Vec<IoEvent>) -> io::Result<()>;
}
