use nexgate::library::{
    config::{GatewayConfig, PortConfig},
    server::Server,
    uring::Uring,
};
use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    time::Duration,
};

fn free_port() -> u16 {
    let spare = TcpListener::bind("127.0.0.1:0").expect("bind");
    spare.local_addr().expect("local addr").port()
}

fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    while !out.windows(needle.len()).any(|w| w == needle) {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

#[test]
fn pong_over_a_real_ring() {
    if let Err(err) = Uring::new(64, 0, 0, false) {
        eprintln!("skipping: io_uring unavailable ({})", err);
        return;
    }
    let port = free_port();
    let mut server = Server::new(GatewayConfig {
        total_chunks: 1024,
        private_pool_chunks: 32,
        idle_wait_ms: 50,
        pin_cores: false,
        handoff_threshold: 0,
        ..GatewayConfig::default()
    });
    server.set_workers(1).set_ports(vec![PortConfig {
        port,
        bind: "127.0.0.1".to_string(),
        ..PortConfig::default()
    }]);
    let running = server.build().start().expect("server start");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"GET /pong HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let out = read_until(&mut stream, b"Pong!");
    assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"), "got {:?}", String::from_utf8_lossy(&out));

    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 8\r\n\r\nABCDEFGH")
        .unwrap();
    let out = read_until(&mut stream, b"ABCDEFGH");
    assert!(out.ends_with(b"\r\n\r\nABCDEFGH"));

    running.shutdown().expect("clean shutdown");
}

#[test]
fn every_worker_shares_the_running_gateway() {
    if let Err(err) = Uring::new(64, 0, 0, false) {
        eprintln!("skipping: io_uring unavailable ({})", err);
        return;
    }
    let port = free_port();
    let mut server = Server::new(GatewayConfig {
        total_chunks: 1024,
        private_pool_chunks: 32,
        idle_wait_ms: 50,
        pin_cores: false,
        ..GatewayConfig::default()
    });
    server.set_workers(2).set_ports(vec![PortConfig {
        port,
        bind: "127.0.0.1".to_string(),
        ..PortConfig::default()
    }]);
    let running = server.build().start().expect("server start");
    let gateway = running.gateway().clone();
    assert_eq!(gateway.workers(), 2);
    // The handle, this clone and one per worker thread.
    assert!(std::sync::Arc::strong_count(&gateway) >= 4);

    running.shutdown().expect("clean shutdown");
    assert!(gateway.is_shutdown());
}
