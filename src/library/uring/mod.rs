pub mod kernel_cmds;

use crate::library::{
    channel::EventWake,
    network::socket_helpers::{outgoing_socket, peer_ip, prepare_incoming_socket},
    server_internals::{CODE_ACCEPT, CODE_WAKE, REQ_RESP_OFFSET, UserData},
    worker::driver::{IoDriver, IoEvent, IoOp, Token},
};
use io_uring::{Builder, IoUring, cqueue, squeue, types};
use kernel_cmds::{accept_multi, close, connect, poll_add, readv, send_msg};
use socket2::SockAddr;
use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener},
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, trace, warn};

pub struct Uring {
    pub uring: IoUring<squeue::Entry, cqueue::Entry>,
}

impl Uring {
    pub fn new(size: u32, sqpoll_idle: u32, affinity: u32, sqpoll_enabled: bool) -> io::Result<Uring> {
        let mut builder: Builder = IoUring::builder();
        // Only the owning worker submits.
        builder.setup_single_issuer();
        if sqpoll_enabled {
            info!("SQPOLL enabled");
            info!("    Uring SQPOLL idle: {}", sqpoll_idle);
            info!("    Uring SQPOLL affinity: {}", affinity);
            builder.setup_sqpoll(sqpoll_idle);
            builder.setup_sqpoll_cpu(affinity);
            builder.dontfork();
        } else {
            builder.setup_submit_all();
        }
        let uring: IoUring<squeue::Entry, cqueue::Entry> = builder.build(size)?;
        Ok(Uring { uring })
    }
}

/// io_uring backed [`IoDriver`] for one worker: its own reuse-port
/// listeners, a poll on its wake descriptor, and per-unit read/send/close.
pub struct UringDriver {
    ring: IoUring<squeue::Entry, cqueue::Entry>,
    /// `(port, listener)`; the index is the accept code offset.
    listeners: Vec<(u16, TcpListener)>,
    wake: Arc<EventWake>,
    wake_armed: bool,
    /// Send headers the kernel still reads, keyed by user data.
    messages: HashMap<u64, Box<libc::msghdr>>,
    /// Addresses of connects still in flight, keyed by user data.
    addresses: HashMap<u64, Box<SockAddr>>,
    completions: Vec<cqueue::Entry>,
}

impl UringDriver {
    pub fn new(uring: Uring, listeners: Vec<(u16, TcpListener)>, wake: Arc<EventWake>) -> io::Result<UringDriver> {
        let mut driver = UringDriver {
            ring: uring.uring,
            listeners,
            wake,
            wake_armed: false,
            messages: HashMap::new(),
            addresses: HashMap::new(),
            completions: Vec::with_capacity(256),
        };
        for index in 0..driver.listeners.len() {
            driver.arm_accept(index)?;
        }
        driver.ring.submit()?;
        Ok(driver)
    }

    pub fn listener_ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|(port, _)| *port).collect()
    }

    fn push(&mut self, entry: squeue::Entry) -> io::Result<()> {
        // SAFETY: entries only point at memory the submit_* callers keep alive.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| io::Error::other("submission queue full"))?;
            }
        }
        Ok(())
    }

    fn arm_accept(&mut self, index: usize) -> io::Result<()> {
        let fd = self.listeners[index].1.as_raw_fd();
        self.push(accept_multi(fd, CODE_ACCEPT + index as u64))
    }

    fn arm_wake(&mut self) -> io::Result<()> {
        if !self.wake_armed {
            self.push(poll_add(self.wake.raw_fd(), CODE_WAKE))?;
            self.wake_armed = true;
        }
        Ok(())
    }

    fn on_accept(&mut self, index: usize, result: i32, more: bool, events: &mut Vec<IoEvent>) -> io::Result<()> {
        let Some(port) = self.listeners.get(index).map(|(port, _)| *port) else {
            return Ok(());
        };
        if result >= 0 {
            let fd = result as RawFd;
            if let Err(err) = prepare_incoming_socket(fd) {
                debug!("Tuning fd {} failed: {}", fd, err);
            }
            trace!("Receive new accept on FD:{} port {}", fd, port);
            events.push(IoEvent::Accepted {
                port,
                fd,
                peer: peer_ip(fd),
            });
        } else {
            warn!("Accept on port {} failed: {}", port, io::Error::from_raw_os_error(-result));
        }
        if !more {
            self.arm_accept(index)?;
        }
        Ok(())
    }

    fn process(&mut self, cqe: cqueue::Entry, events: &mut Vec<IoEvent>) -> io::Result<()> {
        let user_data = cqe.user_data();
        let result = cqe.result();
        match user_data {
            CODE_WAKE => {
                self.wake_armed = false;
                events.push(IoEvent::Woken);
            }
            user_data if user_data >= REQ_RESP_OFFSET => {
                let data = UserData::unpack_user_data(user_data);
                let Some(op) = IoOp::from_u8(data.op as u8) else {
                    trace!("Unmapped op in user data: {user_data}");
                    return Ok(());
                };
                match op {
                    IoOp::Send => drop(self.messages.remove(&user_data)),
                    IoOp::Connect => drop(self.addresses.remove(&user_data)),
                    _ => {}
                }
                events.push(IoEvent::Completed {
                    token: data.token(),
                    op,
                    result,
                });
            }
            user_data if user_data >= CODE_ACCEPT => {
                let more = cqueue::more(cqe.flags());
                self.on_accept((user_data - CODE_ACCEPT) as usize, result, more, events)?;
            }
            _ => trace!("Unmapped user data: {user_data}"),
        }
        Ok(())
    }
}

fn is_benign(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY))
}

impl IoDriver for UringDriver {
    unsafe fn submit_recv(&mut self, token: Token, fd: RawFd, iovecs: &[libc::iovec]) -> io::Result<()> {
        let user_data = UserData::new(token, IoOp::Recv).pack_user_data();
        self.push(unsafe { readv(user_data, fd, iovecs) })
    }

    unsafe fn submit_send(&mut self, token: Token, fd: RawFd, iovecs: &[libc::iovec]) -> io::Result<()> {
        let user_data = UserData::new(token, IoOp::Send).pack_user_data();
        let mut message: Box<libc::msghdr> = Box::new(unsafe { std::mem::zeroed() });
        message.msg_iov = iovecs.as_ptr() as *mut libc::iovec;
        message.msg_iovlen = iovecs.len() as _;
        let entry = unsafe { send_msg(user_data, fd, &message) };
        self.messages.insert(user_data, message);
        if let Err(err) = self.push(entry) {
            self.messages.remove(&user_data);
            return Err(err);
        }
        Ok(())
    }

    fn submit_close(&mut self, token: Token, fd: RawFd) -> io::Result<()> {
        // Fails any read still parked on the socket so the unit can go.
        unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        self.push(close(UserData::new(token, IoOp::Close).pack_user_data(), fd))
    }

    fn open_stream(&mut self, addr: SocketAddr) -> io::Result<RawFd> {
        outgoing_socket(addr)
    }

    fn submit_connect(&mut self, token: Token, fd: RawFd, addr: SocketAddr) -> io::Result<()> {
        let user_data = UserData::new(token, IoOp::Connect).pack_user_data();
        let addr = Box::new(SockAddr::from(addr));
        // SAFETY: the boxed address stays in `addresses` until the completion.
        let entry = unsafe { connect(user_data, fd, &addr) };
        self.addresses.insert(user_data, addr);
        if let Err(err) = self.push(entry) {
            self.addresses.remove(&user_data);
            return Err(err);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, events: &mut Vec<IoEvent>) -> io::Result<()> {
        self.arm_wake()?;
        let result = if !self.ring.completion().is_empty() || timeout.is_zero() {
            self.ring.submit()
        } else {
            let ts = types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let args = types::SubmitArgs::new().timespec(&ts);
            self.ring.submitter().submit_with_args(1, &args)
        };
        match result {
            Ok(_) => {}
            Err(err) if is_benign(&err) => {}
            Err(err) => return Err(err),
        }
        let mut batch = std::mem::take(&mut self.completions);
        batch.extend(self.ring.completion());
        for cqe in batch.drain(..) {
            self.process(cqe, events)?;
        }
        self.completions = batch;
        Ok(())
    }
}
