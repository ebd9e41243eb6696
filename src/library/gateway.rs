//! The process-wide gateway context.
//!
//! Built once before the workers start and shared behind an `Arc`. Workers
//! only reach into it through the thread-safe pieces: channels, the shared
//! chunk pool, the socket table, the registry read lock and their note
//! queues. Anything that reshapes the routing state runs under the global
//! lock, with every worker parked.

use crate::library::{
    channel::{ChannelPair, EventWake, Signal, Wake},
    chunk::pool::SharedChunkPool,
    config::{GatewayConfig, MAX_ACTIVE_BACKENDS},
    error::{GatewayError, GatewayResult},
    global_lock::GlobalLock,
    handlers::{
        BackendId, GATEWAY_BACKEND, Handler, HandlerId,
        builtin::{BackendForwarder, EchoHandler, PongHandler, ProxyRoute, ReverseProxyHandler, StatsHandler},
        port::UriAlias,
        registry::Registry,
    },
    protocol::http::Method,
    session::{Session, SocketInfoTable},
    stats::{BackendReport, ChunkReport, PortReport, Report, UriReport, WorkerStats},
};
use crossbeam_queue::SegQueue;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::{
    net::IpAddr,
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tracing::{debug, info};

const GATEWAY_APP: &str = "gateway";
const PROXY_APP: &str = "reverse-proxy";

/// Cross-worker requests, drained once per loop iteration.
#[derive(Debug)]
pub enum WorkerNote {
    /// Take over an accepted socket from a busier worker.
    Adopt {
        fd: RawFd,
        port: u16,
        peer: Option<IpAddr>,
    },
    /// Close the socket behind this session.
    Disconnect(Session),
    /// Drop whatever is still queued for this backend.
    BackendGone(BackendId),
}

pub struct Gateway {
    config: GatewayConfig,
    registry: RwLock<Registry>,
    shared_pool: Arc<SharedChunkPool>,
    sessions: SocketInfoTable,
    /// `workers x MAX_ACTIVE_BACKENDS x backend_schedulers`, see `channel_index`.
    channels: Box<[ChannelPair]>,
    backend_signals: Box<[Arc<Signal>]>,
    worker_wakes: Box<[Arc<EventWake>]>,
    backend_names: RwLock<Vec<Option<String>>>,
    backend_active: [AtomicBool; MAX_ACTIVE_BACKENDS],
    global_lock: GlobalLock,
    stats: Box<[WorkerStats]>,
    notes: Box<[SegQueue<WorkerNote>]>,
    shutdown: AtomicBool,
    started: Instant,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Arc<Gateway>> {
        config.validate()?;
        let workers = config.workers;
        let schedulers = config.backend_schedulers;

        let worker_wakes = (0..workers)
            .map(|_| EventWake::new())
            .collect::<Result<Box<[_]>, _>>()?;
        let backend_signals: Box<[Arc<Signal>]> =
            (0..MAX_ACTIVE_BACKENDS * schedulers).map(|_| Signal::new()).collect();

        let mut channels = Vec::with_capacity(workers * MAX_ACTIVE_BACKENDS * schedulers);
        for wake in worker_wakes.iter() {
            for signal in backend_signals.iter() {
                channels.push(ChannelPair::new(
                    config.channel_capacity,
                    signal.clone() as Arc<dyn Wake>,
                    wake.clone() as Arc<dyn Wake>,
                ));
            }
        }

        let mut registry = Registry::new(config.case_insensitive_uris, config.strict_uri_boundaries);
        for port in config.ports.iter() {
            registry.add_port(port.port);
            if port.echo {
                registry.register_uri_handler(
                    port.port,
                    Some(Method::Post),
                    "/echo",
                    GATEWAY_BACKEND,
                    GATEWAY_APP,
                    Arc::new(EchoHandler),
                )?;
            }
            if port.pong {
                registry.register_uri_handler(
                    port.port,
                    Some(Method::Get),
                    "/pong",
                    GATEWAY_BACKEND,
                    GATEWAY_APP,
                    Arc::new(PongHandler),
                )?;
            }
            if port.stats {
                registry.register_uri_handler(
                    port.port,
                    Some(Method::Get),
                    "/gwstats",
                    GATEWAY_BACKEND,
                    GATEWAY_APP,
                    Arc::new(StatsHandler),
                )?;
            }
        }
        // Entries sharing port, method and URI become one list; the host picks among them.
        let mut proxies: Vec<((u16, Option<Method>, String), Vec<ProxyRoute>)> = Vec::new();
        for proxy in config.proxies.iter() {
            let (method, uri) = proxy.method_and_uri();
            let route = ProxyRoute {
                host: proxy.host.clone(),
                destination: proxy.destination()?,
            };
            let key = (proxy.port, method, uri.to_string());
            match proxies.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, routes)) => routes.push(route),
                None => proxies.push((key, vec![route])),
            }
        }
        for ((port, method, uri), routes) in proxies {
            debug!("Reverse proxy on port {}: {:?} {} -> {:?}", port, method, uri, routes);
            registry.register_uri_handler(
                port,
                method,
                &uri,
                GATEWAY_BACKEND,
                PROXY_APP,
                Arc::new(ReverseProxyHandler::new(routes)),
            )?;
        }
        for alias in config.aliases.iter() {
            registry.add_alias(
                alias.port,
                UriAlias {
                    method: Method::from_bytes(alias.from_method.as_bytes()),
                    from: alias.from_uri.clone(),
                    to: alias.to_uri.clone(),
                },
            );
        }

        info!(
            "Gateway: {} workers, {} chunks of {} bytes, {} socket slots",
            workers, config.total_chunks, config.chunk_size, config.max_sockets
        );
        Ok(Arc::new(Gateway {
            shared_pool: SharedChunkPool::new(config.total_chunks, config.chunk_size),
            sessions: SocketInfoTable::new(config.max_sockets),
            registry: RwLock::new(registry),
            channels: channels.into_boxed_slice(),
            backend_signals,
            worker_wakes,
            backend_names: RwLock::new(vec![None; MAX_ACTIVE_BACKENDS]),
            backend_active: std::array::from_fn(|_| AtomicBool::new(false)),
            global_lock: GlobalLock::default(),
            stats: (0..workers).map(|_| WorkerStats::default()).collect(),
            notes: (0..workers).map(|_| SegQueue::new()).collect(),
            shutdown: AtomicBool::new(false),
            started: Instant::now(),
            config,
        }))
    }

    #[inline(always)]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[inline(always)]
    pub fn workers(&self) -> usize {
        self.config.workers
    }

    #[inline(always)]
    pub fn schedulers(&self) -> usize {
        self.config.backend_schedulers
    }

    /// Read access for dispatch. Recursive so a handler running under a
    /// worker's read guard can read again without queueing behind a writer.
    #[inline(always)]
    pub fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read_recursive()
    }

    #[inline(always)]
    pub fn shared_pool(&self) -> &Arc<SharedChunkPool> {
        &self.shared_pool
    }

    #[inline(always)]
    pub fn sessions(&self) -> &SocketInfoTable {
        &self.sessions
    }

    #[inline(always)]
    pub fn global_lock(&self) -> &GlobalLock {
        &self.global_lock
    }

    #[inline(always)]
    pub fn worker_wake(&self, worker: u8) -> &Arc<EventWake> {
        &self.worker_wakes[worker as usize]
    }

    #[inline(always)]
    pub fn worker_stats(&self, worker: u8) -> &WorkerStats {
        &self.stats[worker as usize]
    }

    /// Channels per worker.
    #[inline(always)]
    pub fn channels_per_worker(&self) -> usize {
        MAX_ACTIVE_BACKENDS * self.schedulers()
    }

    /// Position of `(backend, scheduler)` within one worker's channels.
    #[inline(always)]
    pub fn channel_index(&self, backend: BackendId, scheduler: usize) -> usize {
        backend as usize * self.schedulers() + scheduler
    }

    pub fn channel(&self, worker: u8, backend: BackendId, scheduler: usize) -> &ChannelPair {
        self.worker_channel(worker, self.channel_index(backend, scheduler))
    }

    #[inline(always)]
    pub fn worker_channel(&self, worker: u8, index: usize) -> &ChannelPair {
        &self.channels[worker as usize * self.channels_per_worker() + index]
    }

    pub fn backend_signal(&self, backend: BackendId, scheduler: usize) -> &Arc<Signal> {
        &self.backend_signals[self.channel_index(backend, scheduler)]
    }

    /// Seconds since start, offset by one so zero keeps meaning "never".
    pub fn now_secs(&self) -> u64 {
        self.started.elapsed().as_secs() + 1
    }

    pub fn is_whitelisted(&self, peer: Option<IpAddr>) -> bool {
        if self.config.whitelist.is_empty() {
            return true;
        }
        peer.is_some_and(|ip| self.config.whitelist.contains(&ip))
    }

    #[inline(always)]
    pub fn backend_active(&self, backend: BackendId) -> bool {
        self.backend_active
            .get(backend as usize)
            .is_some_and(|active| active.load(Ordering::Acquire))
    }

    pub fn backend_name(&self, backend: BackendId) -> Option<String> {
        self.backend_names.read().get(backend as usize).cloned().flatten()
    }

    pub fn wake_workers(&self) {
        for wake in self.worker_wakes.iter() {
            wake.wake();
        }
    }

    pub fn post(&self, worker: u8, note: WorkerNote) {
        if let Some(queue) = self.notes.get(worker as usize) {
            queue.push(note);
            self.worker_wakes[worker as usize].wake();
        }
    }

    #[inline(always)]
    pub fn take_note(&self, worker: u8) -> Option<WorkerNote> {
        self.notes[worker as usize].pop()
    }

    /// Runs `f` with every worker parked and the registry writable.
    fn exclusive<R>(&self, f: impl FnOnce(&mut RwLockWriteGuard<'_, Registry>) -> R) -> R {
        let _guard = self.global_lock.lock(|| self.wake_workers());
        let mut registry = self.registry.write();
        f(&mut registry)
    }

    pub fn register_backend(&self, name: &str) -> GatewayResult<BackendId> {
        let _guard = self.global_lock.lock(|| self.wake_workers());
        let mut names = self.backend_names.write();
        let Some(slot) = names.iter().position(Option::is_none) else {
            return Err(GatewayError::TooManyBackends);
        };
        names[slot] = Some(name.to_string());
        self.backend_active[slot].store(true, Ordering::Release);
        info!("Backend {} registered as {}", name, slot);
        Ok(slot as BackendId)
    }

    fn require_backend(&self, backend: BackendId) -> GatewayResult<()> {
        match self.backend_active(backend) {
            true => Ok(()),
            false => Err(GatewayError::BackendNotFound(backend)),
        }
    }

    /// Routes `method uri` on `port` to `backend`. `None` matches any method.
    pub fn register_uri(
        &self,
        port: u16,
        method: Option<Method>,
        uri: &str,
        backend: BackendId,
        app_name: &str,
    ) -> GatewayResult<HandlerId> {
        self.require_backend(backend)?;
        self.exclusive(|registry| {
            registry.register_uri_handler(port, method, uri, backend, app_name, Arc::new(BackendForwarder { backend }))
        })
    }

    /// Routes every message on a raw `port` to `backend`.
    pub fn register_port(&self, port: u16, backend: BackendId, app_name: &str) -> GatewayResult<HandlerId> {
        self.require_backend(backend)?;
        self.exclusive(|registry| {
            registry.register_port_handler(port, backend, app_name, Arc::new(BackendForwarder { backend }))
        })
    }

    pub fn register_subport(
        &self,
        port: u16,
        subport: u32,
        backend: BackendId,
        app_name: &str,
    ) -> GatewayResult<HandlerId> {
        self.require_backend(backend)?;
        self.exclusive(|registry| {
            registry.register_subport_handler(port, subport, backend, app_name, Arc::new(BackendForwarder { backend }))
        })
    }

    /// A URI the gateway answers itself with `handler`.
    pub fn register_local_uri(
        &self,
        port: u16,
        method: Option<Method>,
        uri: &str,
        app_name: &str,
        handler: Arc<dyn Handler>,
    ) -> GatewayResult<HandlerId> {
        self.exclusive(|registry| registry.register_uri_handler(port, method, uri, GATEWAY_BACKEND, app_name, handler))
    }

    pub fn register_local_port(&self, port: u16, app_name: &str, handler: Arc<dyn Handler>) -> GatewayResult<HandlerId> {
        self.exclusive(|registry| registry.register_port_handler(port, GATEWAY_BACKEND, app_name, handler))
    }

    pub fn add_handler(&self, id: HandlerId, handler: Arc<dyn Handler>) -> GatewayResult<()> {
        self.exclusive(|registry| registry.add_handler(id, handler))
    }

    pub fn unregister(&self, id: HandlerId) -> GatewayResult<()> {
        self.exclusive(|registry| registry.unregister(id))
    }

    /// Takes a backend out of service. Its scheduler threads must already be
    /// stopped: whatever is left in its channels goes back to the shared pool
    /// and every socket bound to it is disconnected by its worker.
    pub fn unregister_backend(&self, backend: BackendId) -> GatewayResult<()> {
        self.require_backend(backend)?;
        let (lists, sessions, chains) = self.exclusive(|registry| {
            self.backend_active[backend as usize].store(false, Ordering::Release);
            self.backend_names.write()[backend as usize] = None;
            let lists = registry.unregister_backend(backend);
            let sessions = self.sessions.detach_backend(backend);
            let mut chains = 0;
            for worker in 0..self.workers() as u8 {
                for scheduler in 0..self.schedulers() {
                    let pair = self.channel(worker, backend, scheduler);
                    while let Some(chain) = pair.to_backend.try_pop().or_else(|| pair.from_backend.try_pop()) {
                        self.shared_pool.release_chain(chain);
                        chains += 1;
                    }
                }
            }
            (lists, sessions, chains)
        });
        for session in sessions.iter() {
            self.post(session.worker, WorkerNote::Disconnect(*session));
        }
        for worker in 0..self.workers() as u8 {
            self.post(worker, WorkerNote::BackendGone(backend));
        }
        info!(
            "Backend {} unregistered: {} handler lists, {} sockets, {} chains released",
            backend,
            lists,
            sessions.len(),
            chains
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        debug!("Gateway shutdown requested");
        self.shutdown.store(true, Ordering::Release);
        self.wake_workers();
        for signal in self.backend_signals.iter() {
            signal.wake();
        }
    }

    #[inline(always)]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn report(&self) -> Report {
        let registry = self.registry();
        let names = self.backend_names.read();
        let location = |backend: BackendId| match backend {
            GATEWAY_BACKEND => GATEWAY_APP.to_string(),
            b => names
                .get(b as usize)
                .cloned()
                .flatten()
                .unwrap_or_else(|| format!("backend-{b}")),
        };
        let ports = registry
            .ports()
            .iter()
            .map(|port| PortReport {
                port: port.port(),
                active_sockets: port.total_active_sockets(),
                accepted: port.accepted(),
                uris: port
                    .uris()
                    .iter()
                    .flat_map(|(method, uri, lists)| {
                        lists.iter().map(move |(backend, id)| (method, uri, *backend, *id))
                    })
                    .map(|(method, uri, backend, id)| UriReport {
                        method: method.map_or("*", |m| m.as_str()).to_string(),
                        uri: uri.to_string(),
                        location: location(backend),
                        app: registry
                            .list(id)
                            .map(|list| list.app_name().to_string())
                            .unwrap_or_default(),
                    })
                    .collect(),
            })
            .collect();
        Report {
            uptime_secs: self.started.elapsed().as_secs(),
            chunks: ChunkReport {
                total: self.shared_pool.total(),
                available: self.shared_pool.available(),
            },
            sessions: self.sessions.active(),
            backends: names
                .iter()
                .enumerate()
                .filter_map(|(id, name)| {
                    name.as_ref().map(|name| BackendReport {
                        id: id as u8,
                        name: name.clone(),
                    })
                })
                .collect(),
            ports,
            workers: self
                .stats
                .iter()
                .enumerate()
                .map(|(worker, stats)| stats.snapshot(worker as u8))
                .collect(),
        }
    }

    /// JSON body for `GET /gwstats`.
    pub fn stats_report(&self) -> GatewayResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.report())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::config::PortConfig;

    fn config() -> GatewayConfig {
        GatewayConfig {
            workers: 2,
            total_chunks: 256,
            private_pool_chunks: 16,
            max_chunks_per_request: 16,
            channel_capacity: 8,
            max_sockets: 16,
            ports: vec![PortConfig {
                port: 8080,
                ..PortConfig::default()
            }],
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn builtins_are_registered_per_port() {
        let gateway = Gateway::new(config()).unwrap();
        let registry = gateway.registry();
        let port = registry.port(8080).unwrap();
        let echo = port.resolve_uri(Method::Post, b"/echo").unwrap();
        assert_eq!(echo.lists[0].0, GATEWAY_BACKEND);
        assert!(port.resolve_uri(Method::Get, b"/echo").is_none());
        assert!(port.resolve_uri(Method::Get, b"/gwstats").is_some());
    }

    #[test]
    fn backend_slots_are_bounded_and_reused() {
        let gateway = Gateway::new(config()).unwrap();
        let ids: Vec<BackendId> = (0..MAX_ACTIVE_BACKENDS)
            .map(|n| gateway.register_backend(&format!("db{n}")).unwrap())
            .collect();
        assert!(matches!(gateway.register_backend("late"), Err(GatewayError::TooManyBackends)));
        gateway.unregister_backend(ids[3]).unwrap();
        assert!(!gateway.backend_active(ids[3]));
        assert_eq!(gateway.register_backend("again").unwrap(), ids[3]);
        assert_eq!(gateway.backend_name(ids[3]).as_deref(), Some("again"));
    }

    #[test]
    fn unregistering_backend_posts_notes_and_drops_routes() {
        let gateway = Gateway::new(config()).unwrap();
        let db = gateway.register_backend("db").unwrap();
        gateway.register_uri(8080, None, "/api", db, "shop").unwrap();
        let session = gateway.sessions().allocate(5, 8080, 1, 1).unwrap();
        gateway.sessions().update(&session, |info| info.backend = Some(db)).unwrap();

        gateway.unregister_backend(db).unwrap();

        assert!(gateway.registry().port(8080).unwrap().resolve_uri(Method::Get, b"/api/x").is_none());
        assert!(matches!(gateway.take_note(1), Some(WorkerNote::Disconnect(s)) if s == session));
        assert!(matches!(gateway.take_note(1), Some(WorkerNote::BackendGone(b)) if b == db));
        assert!(matches!(gateway.take_note(0), Some(WorkerNote::BackendGone(_))));
        assert!(matches!(gateway.register_uri(8080, None, "/api", db, "shop"), Err(GatewayError::BackendNotFound(_))));
    }

    #[test]
    fn report_names_owners() {
        let gateway = Gateway::new(config()).unwrap();
        let db = gateway.register_backend("inventory").unwrap();
        gateway.register_uri(8080, Some(Method::Get), "/items", db, "shop").unwrap();
        let json: serde_json::Value = serde_json::from_slice(&gateway.stats_report().unwrap()).unwrap();
        let uris = json["ports"][0]["uris"].as_array().unwrap();
        assert!(uris.iter().any(|u| u["uri"] == "/items" && u["location"] == "inventory" && u["app"] == "shop"));
        assert!(uris.iter().any(|u| u["uri"] == "/echo" && u["location"] == "gateway"));
        assert_eq!(json["workers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn whitelist_filters_peers() {
        let mut config = config();
        assert!(Gateway::new(config.clone()).unwrap().is_whitelisted(None));
        config.whitelist = vec!["10.0.0.1".parse().unwrap()];
        let gateway = Gateway::new(config).unwrap();
        assert!(gateway.is_whitelisted(Some("10.0.0.1".parse().unwrap())));
        assert!(!gateway.is_whitelisted(Some("10.0.0.2".parse().unwrap())));
        assert!(!gateway.is_whitelisted(None));
    }
}
