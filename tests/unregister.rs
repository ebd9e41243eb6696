mod common;

use common::{PORT, config, output_until, text, turn_until, worker};
use nexgate::library::{
    backend::{BackendAction, BackendApp, BackendHandle, BackendMessage, http_response},
    error::GatewayError,
    protocol::http::Method,
    session::Session,
};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Answers with its own name and remembers which sockets went away.
struct NamedApp {
    name: &'static str,
    gone: Mutex<Vec<Session>>,
}

impl NamedApp {
    fn new(name: &'static str) -> Arc<NamedApp> {
        Arc::new(NamedApp {
            name,
            gone: Mutex::new(Vec::new()),
        })
    }
}

impl BackendApp for NamedApp {
    fn name(&self) -> &str {
        self.name
    }

    fn on_message(&self, message: &BackendMessage<'_>) -> BackendAction {
        BackendAction::Respond(http_response(200, "OK", "text/plain", self.name.as_bytes(), message.keep_alive()))
    }

    fn on_disconnect(&self, session: Session) {
        self.gone.lock().push(session);
    }
}

const REQUEST: &[u8] = b"POST /db HTTP/1.1\r\nContent-Length: 0\r\n\r\n";

#[test]
fn remaining_backend_takes_over_the_uri() {
    let (gateway, mut worker) = worker(config());
    let alpha = BackendHandle::start(&gateway, NamedApp::new("alpha")).unwrap();
    let beta = BackendHandle::start(&gateway, NamedApp::new("beta")).unwrap();
    gateway.register_uri(PORT, Some(Method::Post), "/db", alpha.id(), "alpha").unwrap();
    gateway.register_uri(PORT, Some(Method::Post), "/db", beta.id(), "beta").unwrap();

    let first = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(first, REQUEST);
    let out = text(&output_until(&mut worker, first, |out| out.ends_with(b"alpha")));
    assert!(out.ends_with("\r\n\r\nalpha"), "got {:?}", out);

    alpha.stop().unwrap();
    // The socket alpha served is closed by its worker.
    assert!(turn_until(&mut worker, |w| w.driver().is_closed(first)));

    let second = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(second, REQUEST);
    let out = text(&output_until(&mut worker, second, |out| out.ends_with(b"beta")));
    assert!(out.ends_with("\r\n\r\nbeta"), "got {:?}", out);
    beta.stop().unwrap();
}

#[test]
fn upgraded_socket_is_closed_with_its_backend() {
    let (gateway, mut worker) = worker(config());
    let app = BackendHandle::start(&gateway, NamedApp::new("live")).unwrap();
    gateway.register_uri(PORT, Some(Method::Get), "/ws", app.id(), "live").unwrap();

    let fd = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(
        fd,
        b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    );
    let out = text(&output_until(&mut worker, fd, |out| out.ends_with(b"\r\n\r\n")));
    assert!(out.starts_with("HTTP/1.1 101"));
    assert!(!worker.driver().is_closed(fd));

    app.stop().unwrap();
    assert!(turn_until(&mut worker, |w| w.driver().is_closed(fd)));
    assert!(turn_until(&mut worker, |w| w.active_units() == 0));
}

#[test]
fn backend_hears_about_closed_sockets() {
    let (gateway, mut worker) = worker(config());
    let app = NamedApp::new("watcher");
    let handle = BackendHandle::start(&gateway, app.clone()).unwrap();
    gateway.register_uri(PORT, None, "/db", handle.id(), "watcher").unwrap();

    let fd = worker.driver_mut().connect(PORT);
    worker.driver_mut().feed(fd, REQUEST);
    output_until(&mut worker, fd, |out| out.ends_with(b"watcher"));
    worker.driver_mut().hangup(fd);

    let deadline = Instant::now() + Duration::from_secs(5);
    while app.gone.lock().is_empty() && Instant::now() < deadline {
        worker.turn().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(app.gone.lock().len(), 1);
    assert_eq!(gateway.sessions().active(), 0);
    handle.stop().unwrap();
}

#[test]
fn unknown_backends_are_refused() {
    let (gateway, _worker) = worker(config());
    assert!(matches!(gateway.unregister_backend(7), Err(GatewayError::BackendNotFound(7))));
    assert!(matches!(
        gateway.register_uri(PORT, None, "/x", 7, "nobody"),
        Err(GatewayError::BackendNotFound(7))
    ));
    let id = gateway.register_backend("once").unwrap();
    gateway.unregister_backend(id).unwrap();
    assert!(gateway.unregister_backend(id).is_err());
}
