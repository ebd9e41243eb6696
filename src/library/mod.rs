pub mod backend;
pub mod channel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod gateway;
pub mod global_lock;
pub mod handlers;
pub mod network;
pub mod protocol;
pub mod server;
pub mod server_internals;
pub mod session;
pub mod socket_data;
pub mod stats;
pub mod uring;
pub mod worker;
