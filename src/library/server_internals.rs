use crate::library::{
    error::{GatewayError, GatewayResult},
    uring::Uring,
    worker::driver::{IoOp, Token},
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io,
    net::{SocketAddr, TcpListener},
    os::fd::RawFd,
};
use tracing::{info, warn};

/// Unit operations are packed above this value; everything below is a fixed code.
pub const REQ_RESP_OFFSET: u64 = u64::MAX / 2;
pub const CODE_WAKE: u64 = 0xB;
/// Accept on listener `i` completes with `CODE_ACCEPT + i`.
pub const CODE_ACCEPT: u64 = 0x100;
pub const LISTEN_BACKLOG: i32 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData {
    pub unit: u32,
    pub stamp: u16,
    pub op: u16,
}

impl UserData {
    pub fn new(token: Token, op: IoOp) -> UserData {
        UserData {
            unit: token.unit,
            stamp: token.stamp,
            op: op as u16,
        }
    }

    #[inline(always)]
    pub const fn pack_user_data(&self) -> u64 {
        (((self.op as u64) << 48) | ((self.stamp as u64) << 32) | (self.unit as u64)) + REQ_RESP_OFFSET
    }

    pub fn unpack_user_data(user_data: u64) -> Self {
        let raw = user_data - REQ_RESP_OFFSET;
        Self {
            unit: (raw & 0xFFFF_FFFF) as u32,
            stamp: ((raw >> 32) & 0xFFFF) as u16,
            op: ((raw >> 48) & 0xFFFF) as u16,
        }
    }

    #[inline(always)]
    pub fn token(&self) -> Token {
        Token {
            unit: self.unit,
            stamp: self.stamp,
        }
    }
}

pub trait ServerInternal {
    /// Non-blocking reuse-port listener; every worker binds its own.
    fn build_listener(&self, addr: &str) -> GatewayResult<TcpListener> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| GatewayError::InvalidSetting("bind", addr.to_string()))?;
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let listener = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        listener.set_reuse_address(true)?;
        listener.set_reuse_port(true)?;
        listener.bind(&SockAddr::from(addr))?;
        listener.listen(LISTEN_BACKLOG)?;
        listener.set_nonblocking(true)?;
        Ok(listener.into())
    }

    fn build_uring(&self, size: u32, sqpoll_idle: u32, affinity: u32, use_sqpoll: bool) -> io::Result<Uring> {
        Uring::new(size, sqpoll_idle, affinity, use_sqpoll)
    }
}

#[repr(C)]
struct SockFilter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *mut SockFilter,
}

const SO_ATTACH_REUSEPORT_CBPF: libc::c_int = 51;

/// Steers new connections of a reuse-port group to the listener of the
/// worker running on the CPU that took the packet.
pub fn attach_reuseport_cbpf(fd: RawFd) {
    const BPF_LD: u16 = 0x00;
    const BPF_RET: u16 = 0x06;
    const BPF_W: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_A: u16 = 0x10;
    const SKF_AD_OFF: i32 = -0x1000;
    const SKF_AD_CPU: i32 = 36;

    let mut code = [
        SockFilter {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: (SKF_AD_OFF + SKF_AD_CPU) as u32,
        },
        SockFilter {
            code: BPF_RET | BPF_A,
            jt: 0,
            jf: 0,
            k: 0,
        },
    ];
    let prog = SockFprog {
        len: code.len() as u16,
        filter: code.as_mut_ptr(),
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_ATTACH_REUSEPORT_CBPF,
            &prog as *const SockFprog as *const libc::c_void,
            size_of::<SockFprog>() as libc::socklen_t,
        )
    };
    match ret {
        0 => info!("SO_ATTACH_REUSEPORT_CBPF attached to fd {}", fd),
        _ => warn!("SO_ATTACH_REUSEPORT_CBPF on fd {}: {}", fd, io::Error::last_os_error()),
    }
}
