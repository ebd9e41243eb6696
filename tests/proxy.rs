mod common;

use common::{PORT, config, output_until, text, turn_until, worker};
use nexgate::library::{
    config::{GatewayConfig, ProxyConfig},
    session::{Protocol, SocketFlags},
};
use std::{net::SocketAddr, sync::atomic::Ordering};

const UPSTREAM: &str = "127.0.0.1:7001";
const FALLBACK: &str = "127.0.0.1:7002";
const REQUEST: &[u8] = b"GET /api/items HTTP/1.1\r\nHost: shop.example\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";

fn addr(raw: &str) -> SocketAddr {
    raw.parse().unwrap()
}

fn proxied(routes: &[(Option<&str>, &str)]) -> GatewayConfig {
    GatewayConfig {
        proxies: routes
            .iter()
            .map(|(host, destination)| ProxyConfig {
                port: PORT,
                method_and_uri: "GET /api".to_string(),
                host: host.map(str::to_string),
                destination: destination.to_string(),
            })
            .collect(),
        ..config()
    }
}

#[test]
fn request_and_response_cross_the_relay() {
    let (gateway, mut worker) = worker(proxied(&[(None, UPSTREAM)]));
    let client = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(client, REQUEST);

    assert!(turn_until(&mut worker, |w| w.driver().connected_to(addr(UPSTREAM)).is_some()));
    let upstream = worker.driver().connected_to(addr(UPSTREAM)).unwrap();
    let forwarded = output_until(&mut worker, upstream, |out| out.ends_with(b"\r\n\r\n"));
    assert_eq!(text(&forwarded), text(REQUEST));

    worker.driver_mut().feed(upstream, RESPONSE);
    let answered = output_until(&mut worker, client, |out| out.ends_with(b"hi"));
    assert_eq!(text(&answered), text(RESPONSE));

    assert_eq!(worker.active_units(), 2);
    assert_eq!(gateway.sessions().active(), 2);
    assert_eq!(gateway.worker_stats(0).proxied.load(Ordering::Relaxed), 1);
}

#[test]
fn outbound_socket_is_marked_as_proxy_connect() {
    let (gateway, mut worker) = worker(proxied(&[(None, UPSTREAM)]));
    let client = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(client, REQUEST);
    assert!(turn_until(&mut worker, |w| w.driver().connected_to(addr(UPSTREAM)).is_some()));
    let upstream = worker.driver().connected_to(addr(UPSTREAM)).unwrap();
    output_until(&mut worker, upstream, |out| out.ends_with(b"\r\n\r\n"));

    let infos = gateway.sessions().occupied();
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|info| info.protocol == Protocol::Relay));
    let outbound: Vec<_> = infos
        .iter()
        .filter(|info| info.flags.contains(SocketFlags::PROXY_CONNECT))
        .collect();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].fd, upstream);
}

#[test]
fn pipelined_bytes_follow_the_request() {
    let (_gateway, mut worker) = worker(proxied(&[(None, UPSTREAM)]));
    let client = worker.driver_mut().connect(PORT);
    let mut both = REQUEST.to_vec();
    both.extend_from_slice(b"GET /other HTTP/1.1\r\n\r\n");
    worker.driver_mut().feed(client, &both);

    assert!(turn_until(&mut worker, |w| w.driver().connected_to(addr(UPSTREAM)).is_some()));
    let upstream = worker.driver().connected_to(addr(UPSTREAM)).unwrap();
    let forwarded = output_until(&mut worker, upstream, |out| out.ends_with(b"/other HTTP/1.1\r\n\r\n"));
    assert_eq!(forwarded, both);
}

#[test]
fn upstream_hangup_flushes_then_closes_the_client() {
    let (gateway, mut worker) = worker(proxied(&[(None, UPSTREAM)]));
    let client = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(client, REQUEST);
    assert!(turn_until(&mut worker, |w| w.driver().connected_to(addr(UPSTREAM)).is_some()));
    let upstream = worker.driver().connected_to(addr(UPSTREAM)).unwrap();
    output_until(&mut worker, upstream, |out| out.ends_with(b"\r\n\r\n"));

    // Slow sends keep part of the response queued when the upstream goes away.
    worker.driver_mut().send_limit = 4;
    worker.driver_mut().feed(upstream, RESPONSE);
    worker.driver_mut().hangup(upstream);

    let answered = output_until(&mut worker, client, |out| out.ends_with(b"hi"));
    assert_eq!(text(&answered), text(RESPONSE));
    assert!(turn_until(&mut worker, |w| w.driver().is_closed(client) && w.driver().is_closed(upstream)));
    assert!(turn_until(&mut worker, |w| w.active_units() == 0));
    assert_eq!(gateway.sessions().active(), 0);
}

#[test]
fn client_hangup_closes_the_upstream() {
    let (gateway, mut worker) = worker(proxied(&[(None, UPSTREAM)]));
    let client = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(client, REQUEST);
    assert!(turn_until(&mut worker, |w| w.driver().connected_to(addr(UPSTREAM)).is_some()));
    let upstream = worker.driver().connected_to(addr(UPSTREAM)).unwrap();
    output_until(&mut worker, upstream, |out| out.ends_with(b"\r\n\r\n"));

    worker.driver_mut().hangup(client);
    assert!(turn_until(&mut worker, |w| w.driver().is_closed(upstream)));
    assert!(turn_until(&mut worker, |w| w.active_units() == 0));
    assert_eq!(gateway.sessions().active(), 0);
}

#[test]
fn refused_connect_answers_bad_gateway() {
    let (gateway, mut worker) = worker(proxied(&[(None, UPSTREAM)]));
    worker.driver_mut().refused.push(addr(UPSTREAM));
    let client = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(client, REQUEST);

    let out = text(&output_until(&mut worker, client, |out| out.ends_with(b"\r\n\r\n")));
    assert!(out.starts_with("HTTP/1.1 502"), "got {:?}", out);
    assert!(turn_until(&mut worker, |w| w.driver().is_closed(client)));
    let upstream = worker.driver().connected_to(addr(UPSTREAM)).unwrap();
    assert!(worker.driver().is_closed(upstream));
    assert!(turn_until(&mut worker, |w| w.active_units() == 0));
    assert_eq!(gateway.sessions().active(), 0);
}

#[test]
fn host_header_picks_the_destination() {
    let (_gateway, mut worker) = worker(proxied(&[(Some("shop.example"), UPSTREAM), (None, FALLBACK)]));

    let shop = worker.driver_mut().connect(PORT);
    worker
        .driver_mut()
        .feed(shop, b"GET /api HTTP/1.1\r\nHost: SHOP.example\r\n\r\n");
    assert!(turn_until(&mut worker, |w| w.driver().connected_to(addr(UPSTREAM)).is_some()));

    let other = worker.driver_mut().connect(PORT);
    worker
        .driver_mut()
        .feed(other, b"GET /api HTTP/1.1\r\nHost: blog.example\r\n\r\n");
    assert!(turn_until(&mut worker, |w| w.driver().connected_to(addr(FALLBACK)).is_some()));
    assert_eq!(worker.driver().connects.len(), 2);
}
