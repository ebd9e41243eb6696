use crate::library::{
    chunk::CHUNK_HEADER_LEN,
    error::{GatewayError, GatewayResult},
    protocol::http::Method,
};
use serde::Deserialize;
use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
};

pub const MAX_WORKER_THREADS: usize = 32;
pub const MAX_ACTIVE_BACKENDS: usize = 16;
pub const MAX_PORTS: usize = 32;
pub const MAX_BACKEND_SCHEDULERS: usize = 4;

/// How a worker picks the backend channel when more than one backend
/// answers the same handler list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    #[default]
    RoundRobin,
    LeastQueued,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub port: u16,
    pub bind: String,
    /// Attach the built-in `POST /echo` handler.
    pub echo: bool,
    /// Attach `GET /gwstats`.
    pub stats: bool,
    /// Attach `GET /pong`.
    pub pong: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            port: 8080,
            bind: "0.0.0.0".to_string(),
            echo: true,
            stats: true,
            pong: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasConfig {
    pub port: u16,
    pub from_method: String,
    pub from_uri: String,
    pub to_uri: String,
}

/// Requests matching `method_and_uri` (and `host`, when set) on `port` are
/// relayed to `destination`, and the connection stays relayed after that.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub port: u16,
    /// `"GET /api"`, or a bare `"/api"` for any method.
    pub method_and_uri: String,
    #[serde(default)]
    pub host: Option<String>,
    /// `ip:port` of the proxied server.
    pub destination: String,
}

impl ProxyConfig {
    pub fn method_and_uri(&self) -> (Option<Method>, &str) {
        let raw = self.method_and_uri.trim();
        match raw.split_once(' ') {
            Some((method, uri)) => (Some(Method::from_bytes(method.as_bytes())), uri.trim()),
            None => (None, raw),
        }
    }

    pub fn destination(&self) -> GatewayResult<SocketAddr> {
        self.destination
            .parse()
            .map_err(|_| GatewayError::InvalidSetting("proxies.destination", self.destination.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub workers: usize,
    pub chunk_size: usize,
    pub total_chunks: usize,
    pub private_pool_chunks: usize,
    pub max_chunks_per_request: usize,
    pub channel_capacity: usize,
    pub shared_pool_timeout_ms: u64,
    pub max_sockets: usize,
    pub inactive_socket_timeout_secs: u64,
    pub idle_wait_ms: u64,
    pub uring_size: u32,
    pub sqpoll_enabled: bool,
    pub sqpoll_idle: u32,
    pub realtime: bool,
    pub pin_cores: bool,
    pub scheduling: Scheduling,
    /// Scheduler threads per backend, each with its own channel per worker.
    pub backend_schedulers: usize,
    /// An accepting worker hands a new socket to the least busy worker once
    /// it owns this many more sockets than that worker. 0 disables handoff.
    pub handoff_threshold: usize,
    pub case_insensitive_uris: bool,
    /// Only accept URI prefixes ending on a `/` or `?` boundary of the request.
    pub strict_uri_boundaries: bool,
    pub log_level: String,
    pub ports: Vec<PortConfig>,
    pub whitelist: Vec<IpAddr>,
    pub aliases: Vec<AliasConfig>,
    pub proxies: Vec<ProxyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            workers: num_cpus::get().clamp(1, MAX_WORKER_THREADS),
            chunk_size: 4096,
            total_chunks: 16384,
            private_pool_chunks: 128,
            max_chunks_per_request: 512,
            channel_capacity: 1024,
            shared_pool_timeout_ms: 10,
            max_sockets: 65536,
            inactive_socket_timeout_secs: 60,
            idle_wait_ms: 1000,
            uring_size: 4096,
            sqpoll_enabled: false,
            sqpoll_idle: 5000,
            realtime: false,
            pin_cores: true,
            scheduling: Scheduling::RoundRobin,
            backend_schedulers: 1,
            handoff_threshold: 64,
            case_insensitive_uris: false,
            strict_uri_boundaries: false,
            log_level: "info".to_string(),
            ports: vec![PortConfig::default()],
            whitelist: Vec::new(),
            aliases: Vec::new(),
            proxies: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> GatewayResult<GatewayConfig> {
        let config: GatewayConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<GatewayConfig> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Chunks trimmed back to the shared pool only above this mark.
    #[inline(always)]
    pub fn private_pool_high_water(&self) -> usize {
        self.private_pool_chunks * 2
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.workers == 0 || self.workers > MAX_WORKER_THREADS {
            return Err(GatewayError::InvalidSetting(
                "workers",
                format!("must be within 1..={MAX_WORKER_THREADS}, got {}", self.workers),
            ));
        }
        if self.chunk_size < CHUNK_HEADER_LEN + 256 {
            return Err(GatewayError::InvalidSetting(
                "chunk_size",
                format!("must be at least {} bytes", CHUNK_HEADER_LEN + 256),
            ));
        }
        if self.total_chunks == 0 || self.channel_capacity == 0 || self.max_sockets == 0 {
            return Err(GatewayError::InvalidSetting(
                "total_chunks/channel_capacity/max_sockets",
                "must be non-zero".to_string(),
            ));
        }
        if self.max_chunks_per_request == 0 || self.max_chunks_per_request > self.total_chunks {
            return Err(GatewayError::InvalidSetting(
                "max_chunks_per_request",
                format!("must be within 1..={}", self.total_chunks),
            ));
        }
        if self.private_pool_chunks * self.workers > self.total_chunks {
            return Err(GatewayError::InvalidSetting(
                "private_pool_chunks",
                format!(
                    "{} workers x {} private chunks exceed {} total chunks",
                    self.workers, self.private_pool_chunks, self.total_chunks
                ),
            ));
        }
        if self.backend_schedulers == 0 || self.backend_schedulers > MAX_BACKEND_SCHEDULERS {
            return Err(GatewayError::InvalidSetting(
                "backend_schedulers",
                format!("must be within 1..={MAX_BACKEND_SCHEDULERS}"),
            ));
        }
        if self.ports.len() > MAX_PORTS {
            return Err(GatewayError::InvalidSetting(
                "ports",
                format!("at most {MAX_PORTS} ports"),
            ));
        }
        for proxy in self.proxies.iter() {
            proxy.destination()?;
            if !self.ports.iter().any(|port| port.port == proxy.port) {
                return Err(GatewayError::InvalidSetting(
                    "proxies.port",
                    format!("{} is not a configured port", proxy.port),
                ));
            }
            if !proxy.method_and_uri().1.starts_with('/') {
                return Err(GatewayError::InvalidSetting(
                    "proxies.method_and_uri",
                    proxy.method_and_uri.clone(),
                ));
            }
        }
        Ok(())
    }
}
