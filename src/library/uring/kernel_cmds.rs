use io_uring::{opcode, squeue, types};
use libc::{SOCK_NONBLOCK, msghdr};
use socket2::SockAddr;
use std::os::fd::RawFd;
use tracing::trace;

#[inline(always)]
pub fn accept_multi(fd: RawFd, user_data: u64) -> squeue::Entry {
    trace!("Kernel Call: AcceptMulti");
    opcode::AcceptMulti::new(types::Fd(fd))
        .flags(libc::SOCK_CLOEXEC | SOCK_NONBLOCK)
        .build()
        .user_data(user_data)
}

/// # Safety
/// `iovecs` and the buffers they describe must outlive the operation.
#[inline(always)]
pub unsafe fn readv(user_data: u64, client_fd: RawFd, iovecs: &[libc::iovec]) -> squeue::Entry {
    trace!("Kernel Call: Readv ({} iovecs)", iovecs.len());
    opcode::Readv::new(types::Fd(client_fd), iovecs.as_ptr(), iovecs.len() as u32)
        .build()
        .user_data(user_data)
}

/// # Safety
/// `data`, its iovec array and the buffers behind it must outlive the operation.
#[inline(always)]
pub unsafe fn send_msg(user_data: u64, client_fd: RawFd, data: &msghdr) -> squeue::Entry {
    trace!("Kernel Call: SendMsg");
    opcode::SendMsg::new(types::Fd(client_fd), data)
        .flags(libc::MSG_NOSIGNAL as u32)
        .build()
        .user_data(user_data)
}

/// # Safety
/// `addr` must outlive the operation.
#[inline(always)]
pub unsafe fn connect(user_data: u64, fd: RawFd, addr: &SockAddr) -> squeue::Entry {
    trace!("Kernel Call: Connect");
    opcode::Connect::new(types::Fd(fd), addr.as_ptr() as *const libc::sockaddr, addr.len())
        .build()
        .user_data(user_data)
}

#[inline(always)]
pub fn close(user_data: u64, client_fd: RawFd) -> squeue::Entry {
    trace!("Kernel Call: Close");
    opcode::Close::new(types::Fd(client_fd))
        .build()
        .user_data(user_data)
}

#[inline(always)]
pub fn poll_add(fd: RawFd, user_data: u64) -> squeue::Entry {
    trace!("Kernel Call: PollAdd");
    opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
        .build()
        .user_data(user_data)
}
