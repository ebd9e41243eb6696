//! Counters each worker bumps and the JSON report built from them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counters. Only the owning worker writes; anyone may read.
#[derive(Default)]
pub struct WorkerStats {
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub accepted: AtomicU64,
    pub disconnected: AtomicU64,
    pub to_backend: AtomicU64,
    pub from_backend: AtomicU64,
    pub overflowed: AtomicU64,
    pub rejected: AtomicU64,
    /// Outbound connects made for reverse-proxied requests.
    pub proxied: AtomicU64,
}

#[inline(always)]
pub fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl WorkerStats {
    pub fn snapshot(&self, worker: u8) -> WorkerReport {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WorkerReport {
            worker,
            bytes_received: load(&self.bytes_received),
            bytes_sent: load(&self.bytes_sent),
            packets_received: load(&self.packets_received),
            packets_sent: load(&self.packets_sent),
            accepted: load(&self.accepted),
            disconnected: load(&self.disconnected),
            to_backend: load(&self.to_backend),
            from_backend: load(&self.from_backend),
            overflowed: load(&self.overflowed),
            rejected: load(&self.rejected),
            proxied: load(&self.proxied),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: u8,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub accepted: u64,
    pub disconnected: u64,
    pub to_backend: u64,
    pub from_backend: u64,
    pub overflowed: u64,
    pub rejected: u64,
    pub proxied: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReport {
    pub total: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UriReport {
    pub method: String,
    pub uri: String,
    /// `"gateway"` or the backend's name.
    pub location: String,
    pub app: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortReport {
    pub port: u16,
    pub active_sockets: usize,
    pub accepted: u64,
    pub uris: Vec<UriReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub id: u8,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub uptime_secs: u64,
    pub chunks: ChunkReport,
    pub sessions: usize,
    pub backends: Vec<BackendReport>,
    pub ports: Vec<PortReport>,
    pub workers: Vec<WorkerReport>,
}
