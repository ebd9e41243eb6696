use crate::library::{
    config::{GatewayConfig, PortConfig},
    error::{GatewayError, GatewayResult},
    gateway::Gateway,
    server_internals::{ServerInternal, attach_reuseport_cbpf},
    uring::UringDriver,
    worker::Worker,
};
use core_affinity::CoreId;
use std::{
    net::TcpListener,
    os::fd::AsRawFd,
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{error, info, warn};

#[derive(Clone, Debug, Default)]
pub struct Server {
    config: GatewayConfig,
}

impl ServerInternal for Server {}

// Public server endpoints
impl Server {
    pub fn new(config: GatewayConfig) -> Server {
        Server { config }
    }

    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Server> {
        Ok(Server::new(GatewayConfig::from_file(path)?))
    }

    #[inline(always)]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
    #[inline(always)]
    pub fn get_workers(&self) -> usize {
        self.config.workers
    }
    #[inline(always)]
    pub fn set_workers(&mut self, workers: usize) -> &mut Self {
        self.config.workers = workers;
        self
    }
    #[inline(always)]
    pub fn get_sqpoll_enabled(&self) -> bool {
        self.config.sqpoll_enabled
    }
    #[inline(always)]
    pub fn set_sqpoll_enabled(&mut self, enabled: bool) -> &mut Self {
        self.config.sqpoll_enabled = enabled;
        self
    }
    #[inline(always)]
    pub fn get_sqpoll_idle(&self) -> u32 {
        self.config.sqpoll_idle
    }
    #[inline(always)]
    pub fn set_sqpoll_idle(&mut self, sqpoll_idle: u32) -> &mut Self {
        self.config.sqpoll_idle = sqpoll_idle;
        self
    }
    #[inline(always)]
    pub fn set_uring_size(&mut self, uring_size: u32) -> &mut Self {
        self.config.uring_size = uring_size;
        self
    }
    #[inline(always)]
    pub fn get_realtime(&self) -> bool {
        self.config.realtime
    }
    #[inline(always)]
    pub fn set_realtime(&mut self, enabled: bool) -> &mut Self {
        self.config.realtime = enabled;
        self
    }
    #[inline(always)]
    pub fn set_pin_cores(&mut self, enabled: bool) -> &mut Self {
        self.config.pin_cores = enabled;
        self
    }
    /// Adds a listening port, replacing an entry with the same number.
    pub fn add_port(&mut self, port: PortConfig) -> &mut Self {
        self.config.ports.retain(|p| p.port != port.port);
        self.config.ports.push(port);
        self
    }
    pub fn set_ports(&mut self, ports: Vec<PortConfig>) -> &mut Self {
        self.config.ports = ports;
        self
    }
    #[inline(always)]
    pub fn build(&mut self) -> Self {
        self.clone()
    }

    /// Builds the gateway, binds every worker's listeners and starts the
    /// worker threads.
    pub fn start(self) -> GatewayResult<RunningServer> {
        let gateway = Gateway::new(self.config.clone())?;
        let mut per_worker = Vec::with_capacity(gateway.workers());
        for _ in 0..gateway.workers() {
            per_worker.push(self.listeners()?);
        }
        let core_ids: Vec<CoreId> = match self.config.pin_cores {
            true => core_affinity::get_core_ids().unwrap_or_default(),
            false => Vec::new(),
        };
        let mut threads = Vec::with_capacity(per_worker.len());
        for (id, listeners) in per_worker.into_iter().enumerate() {
            let core = match core_ids.is_empty() {
                true => None,
                false => Some(core_ids[id % core_ids.len()]),
            };
            let server = self.clone();
            let worker_gateway = gateway.clone();
            info!("Thread {} starting", id);
            let spawned = thread::Builder::new()
                .name(format!("Nexgate-{}", id))
                .spawn(move || server.worker_main(id as u8, worker_gateway, listeners, core));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    gateway.shutdown();
                    return Err(err.into());
                }
            }
        }
        Ok(RunningServer { gateway, threads })
    }

    fn listeners(&self) -> GatewayResult<Vec<(u16, TcpListener)>> {
        let mut listeners = Vec::with_capacity(self.config.ports.len());
        for port in self.config.ports.iter() {
            let listener = self.build_listener(&format!("{}:{}", port.bind, port.port))?;
            if self.config.pin_cores {
                attach_reuseport_cbpf(listener.as_raw_fd());
            }
            listeners.push((port.port, listener));
        }
        Ok(listeners)
    }

    fn worker_main(
        &self,
        id: u8,
        gateway: Arc<Gateway>,
        listeners: Vec<(u16, TcpListener)>,
        core: Option<CoreId>,
    ) -> GatewayResult<()> {
        if let Some(core) = core {
            match core_affinity::set_for_current(core) {
                true => info!("Core {} set affinity to {:?}", id, core),
                false => error!("Failed to set core affinity"),
            }
        }
        if self.config.realtime {
            set_realtime_priority();
        }
        info!("Build Uring instance.");
        let affinity = core.map(|core| core.id as u32).unwrap_or(id as u32);
        let uring = self.build_uring(
            self.config.uring_size,
            self.config.sqpoll_idle,
            affinity,
            self.config.sqpoll_enabled,
        )?;
        let driver = UringDriver::new(uring, listeners, gateway.worker_wake(id).clone())?;
        info!("Worker {} listening on {:?}", id, driver.listener_ports());
        let mut worker = Worker::new(id, gateway.clone(), driver);
        let result = worker.run();
        if result.is_err() {
            // One dead worker leaves its share of the reuse-port group unserved.
            gateway.shutdown();
        }
        result
    }
}

fn set_realtime_priority() {
    let param = libc::sched_param {
        sched_priority: unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) },
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        warn!("SCHED_FIFO refused: {}", std::io::Error::last_os_error());
    }
}

/// Handle to the started worker threads.
pub struct RunningServer {
    gateway: Arc<Gateway>,
    threads: Vec<JoinHandle<GatewayResult<()>>>,
}

impl RunningServer {
    #[inline(always)]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Blocks until every worker has stopped. Returns the first worker error.
    pub fn wait(self) -> GatewayResult<()> {
        let mut first = Ok(());
        for thread in self.threads {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            let result = match thread.join() {
                Ok(result) => result,
                Err(_) => Err(GatewayError::ThreadPanicked(name)),
            };
            if let Err(err) = result {
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        first
    }

    pub fn shutdown(self) -> GatewayResult<()> {
        self.gateway.shutdown();
        self.wait()
    }
}

pub fn run(server: Server) -> GatewayResult<()> {
    server.start()?.wait()
}
