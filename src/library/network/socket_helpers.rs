use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::{
    io,
    mem::ManuallyDrop,
    net::{IpAddr, SocketAddr, TcpStream},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
};
use tracing::trace;

const CLIENT_SNDBUF: usize = 1024 * 1024;

/// Borrows an accepted descriptor as a stream without taking ownership.
fn borrow_stream(client_fd: RawFd) -> ManuallyDrop<TcpStream> {
    ManuallyDrop::new(unsafe { TcpStream::from_raw_fd(client_fd) })
}

/// Nagle off and a 1MB send buffer.
pub fn prepare_incoming_socket(client_fd: RawFd) -> io::Result<()> {
    let stream = borrow_stream(client_fd);
    stream.set_nodelay(true)?;
    let socket = SockRef::from(&*stream);
    socket.set_send_buffer_size(CLIENT_SNDBUF)?;
    trace!("Real sndbuf client size: {} bytes", socket.send_buffer_size()?);
    Ok(())
}

/// Non-blocking stream socket, Nagle off, for a connection the gateway opens.
pub fn outgoing_socket(addr: SocketAddr) -> io::Result<RawFd> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_tcp_nodelay(true)?;
    trace!("Outgoing socket {} for {}", socket.as_raw_fd(), addr);
    Ok(socket.into_raw_fd())
}

pub fn peer_ip(client_fd: RawFd) -> Option<IpAddr> {
    borrow_stream(client_fd).peer_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, os::fd::AsRawFd};

    #[test]
    fn accepted_socket_gets_tuned_and_reports_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        prepare_incoming_socket(accepted.as_raw_fd()).unwrap();
        assert!(accepted.nodelay().unwrap());
        assert_eq!(peer_ip(accepted.as_raw_fd()), Some(client.local_addr().unwrap().ip()));
    }

    #[test]
    fn outgoing_socket_is_nonblocking_and_tuned() {
        let fd = outgoing_socket("127.0.0.1:9".parse().unwrap()).unwrap();
        let socket = unsafe { Socket::from_raw_fd(fd) };
        assert!(socket.tcp_nodelay().unwrap());
        assert!(socket.nonblocking().unwrap());
    }
}
