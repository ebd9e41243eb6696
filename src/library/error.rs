use std::{io, net::SocketAddr};
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Coarse classes the worker reacts to. See `Worker::fail_unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Out of chunks, sockets, handler slots or room in a request.
    Exhaustion,
    /// The peer sent something we cannot parse.
    Protocol,
    /// Nothing wants the request.
    Routing,
    /// Socket or backend went away.
    Transport,
    Config,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("chunk pool exhausted: requested {requested}, available {available}")]
    ChunkPoolExhausted { requested: usize, available: usize },
    #[error("shared chunk pool lock timed out")]
    SharedPoolTimeout,
    #[error("too many HTTP headers (limit {0})")]
    TooManyHeaders(usize),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("socket table is full")]
    SocketTableFull,
    #[error("handler table is full")]
    HandlerTableFull,
    #[error("channel is full")]
    ChannelFull,
    #[error("malformed HTTP: {0}")]
    MalformedHttp(&'static str),
    #[error("connection closed before HTTP headers were complete")]
    IncompleteHeaders,
    #[error("malformed WebSocket frame: {0}")]
    MalformedWebSocket(&'static str),
    #[error("unsupported WebSocket version")]
    WsUnsupportedVersion,
    #[error("request was not handled")]
    NotHandled,
    #[error("handler {0} not found")]
    HandlerNotFound(u32),
    #[error("port {0} not found")]
    PortNotFound(u16),
    #[error("{0} is already registered by backend {1}")]
    UriAlreadyRegistered(String, u8),
    #[error("too many active backends")]
    TooManyBackends,
    #[error("backend {0} not found")]
    BackendNotFound(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("socket closed by peer")]
    SocketClosed,
    #[error("session is stale")]
    StaleSession,
    #[error("backend {0} is gone")]
    BackendGone(u8),
    #[error("proxied server {0} is unreachable")]
    ProxyUnreachable(SocketAddr),
    #[error("thread {0} panicked")]
    ThreadPanicked(String),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid setting `{0}`: {1}")]
    InvalidSetting(&'static str, String),
}

impl GatewayError {
    /// Stable numeric code, reported in logs and the stats page.
    pub fn code(&self) -> u32 {
        match self {
            GatewayError::ChunkPoolExhausted { .. } => 12001,
            GatewayError::SharedPoolTimeout => 12002,
            GatewayError::TooManyHeaders(_) => 12003,
            GatewayError::PayloadTooLarge(_) => 12004,
            GatewayError::SocketTableFull => 12005,
            GatewayError::HandlerTableFull => 12006,
            GatewayError::ChannelFull => 12007,
            GatewayError::MalformedHttp(_) => 12020,
            GatewayError::IncompleteHeaders => 12021,
            GatewayError::MalformedWebSocket(_) => 12022,
            GatewayError::WsUnsupportedVersion => 12023,
            GatewayError::NotHandled => 12040,
            GatewayError::HandlerNotFound(_) => 12041,
            GatewayError::PortNotFound(_) => 12042,
            GatewayError::UriAlreadyRegistered(..) => 12043,
            GatewayError::TooManyBackends => 12044,
            GatewayError::BackendNotFound(_) => 12045,
            GatewayError::Io(_) => 12060,
            GatewayError::SocketClosed => 12061,
            GatewayError::StaleSession => 12062,
            GatewayError::BackendGone(_) => 12063,
            GatewayError::ThreadPanicked(_) => 12064,
            GatewayError::ProxyUnreachable(_) => 12065,
            GatewayError::Config(_) => 12080,
            GatewayError::InvalidSetting(..) => 12081,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::ChunkPoolExhausted { .. }
            | GatewayError::SharedPoolTimeout
            | GatewayError::TooManyHeaders(_)
            | GatewayError::PayloadTooLarge(_)
            | GatewayError::SocketTableFull
            | GatewayError::HandlerTableFull
            | GatewayError::ChannelFull => ErrorKind::Exhaustion,
            GatewayError::MalformedHttp(_)
            | GatewayError::IncompleteHeaders
            | GatewayError::MalformedWebSocket(_)
            | GatewayError::WsUnsupportedVersion => ErrorKind::Protocol,
            GatewayError::NotHandled
            | GatewayError::HandlerNotFound(_)
            | GatewayError::PortNotFound(_)
            | GatewayError::UriAlreadyRegistered(..)
            | GatewayError::TooManyBackends
            | GatewayError::BackendNotFound(_) => ErrorKind::Routing,
            GatewayError::Io(_)
            | GatewayError::SocketClosed
            | GatewayError::StaleSession
            | GatewayError::BackendGone(_)
            | GatewayError::ThreadPanicked(_)
            | GatewayError::ProxyUnreachable(_) => ErrorKind::Transport,
            GatewayError::Config(_) | GatewayError::InvalidSetting(..) => ErrorKind::Config,
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}
