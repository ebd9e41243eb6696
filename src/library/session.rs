//! Process-wide socket slot table.
//!
//! A slot is addressed by its linear index, but a reference to it is only
//! good while the caller's salt matches the slot's current one. The salt is
//! drawn fresh on every allocation and never repeats the slot's previous
//! one, so a late backend reply aimed at a slot that has since been
//! recycled fails validation instead of landing on an unrelated connection.

use crate::library::{
    config::MAX_WORKER_THREADS,
    error::{GatewayError, GatewayResult},
};
use bitflags::bitflags;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::{
    fmt,
    os::fd::RawFd,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use tracing::{debug, trace};

/// Salt value of a free slot. Never handed out.
const INVALID_SALT: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session {
    pub salt: u64,
    pub slot: u32,
    pub worker: u8,
}

impl Session {
    /// 16 hex digits of salt, 6 of slot, 2 of worker.
    pub fn to_hex(&self) -> String {
        format!("{:016x}{:06x}{:02x}", self.salt, self.slot & 0xFF_FFFF, self.worker)
    }

    pub fn parse_hex(raw: &str) -> Option<Session> {
        if raw.len() != 24 || !raw.is_ascii() {
            return None;
        }
        Some(Session {
            salt: u64::from_str_radix(&raw[..16], 16).ok()?,
            slot: u32::from_str_radix(&raw[16..22], 16).ok()?,
            worker: u8::from_str_radix(&raw[22..], 16).ok()?,
        })
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketFlags: u16 {
        /// The gateway opened this socket towards a proxied server.
        const PROXY_CONNECT = 1 << 1;
        const DISCONNECT_AFTER_SEND = 1 << 2;
        const WS_CLOSE_SENT = 1 << 3;
        const STREAMING_RESPONSE = 1 << 4;
        const DISCONNECT_PUSHED_TO_BACKEND = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http1,
    WebSocket,
    Raw,
    /// Bytes pass untouched to the paired socket of a reverse proxy.
    Relay,
}

#[derive(Debug, Clone, Copy)]
pub struct SocketInfo {
    pub fd: RawFd,
    pub session: Session,
    /// Process-wide unique socket id, never reused.
    pub stamp: u64,
    pub port: u16,
    pub backend: Option<u8>,
    pub protocol: Protocol,
    pub ws_group: u32,
    /// Seconds since gateway start of the last activity; 0 means never touched.
    pub timestamp: u64,
    pub flags: SocketFlags,
}

impl SocketInfo {
    fn vacant(slot: u32) -> SocketInfo {
        SocketInfo {
            fd: -1,
            session: Session {
                salt: INVALID_SALT,
                slot,
                worker: 0,
            },
            stamp: 0,
            port: 0,
            backend: None,
            protocol: Protocol::Http1,
            ws_group: 0,
            timestamp: 0,
            flags: SocketFlags::empty(),
        }
    }
}

/// Draws until the value is neither the free marker nor `previous`.
fn fresh_salt(previous: u64, mut draw: impl FnMut() -> u64) -> u64 {
    loop {
        let salt = draw();
        if salt != INVALID_SALT && salt != previous {
            return salt;
        }
    }
}

pub struct SocketInfoTable {
    infos: Box<[Mutex<SocketInfo>]>,
    salts: Box<[AtomicU64]>,
    /// Last salt handed out per slot; survives release.
    issued: Box<[AtomicU64]>,
    free: ArrayQueue<u32>,
    next_stamp: AtomicU64,
    active_per_worker: [AtomicUsize; MAX_WORKER_THREADS],
}

impl SocketInfoTable {
    pub fn new(capacity: usize) -> SocketInfoTable {
        let free = ArrayQueue::new(capacity.max(1));
        for slot in 0..capacity as u32 {
            let _ = free.push(slot);
        }
        SocketInfoTable {
            infos: (0..capacity as u32)
                .map(|slot| Mutex::new(SocketInfo::vacant(slot)))
                .collect(),
            salts: (0..capacity).map(|_| AtomicU64::new(INVALID_SALT)).collect(),
            issued: (0..capacity).map(|_| AtomicU64::new(INVALID_SALT)).collect(),
            free,
            next_stamp: AtomicU64::new(1),
            active_per_worker: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.infos.len()
    }

    pub fn active(&self) -> usize {
        self.capacity() - self.free.len()
    }

    pub fn active_for_worker(&self, worker: u8) -> usize {
        self.active_per_worker[worker as usize].load(Ordering::Relaxed)
    }

    /// Takes a free slot and gives it a fresh salt.
    pub fn allocate(&self, fd: RawFd, port: u16, worker: u8, now: u64) -> GatewayResult<Session> {
        let slot = self.free.pop().ok_or(GatewayError::SocketTableFull)?;
        let previous = self.issued[slot as usize].load(Ordering::Relaxed);
        let salt = fresh_salt(previous, rand::random::<u64>);
        self.issued[slot as usize].store(salt, Ordering::Relaxed);
        let session = Session { salt, slot, worker };
        *self.infos[slot as usize].lock() = SocketInfo {
            fd,
            session,
            stamp: self.next_stamp.fetch_add(1, Ordering::Relaxed),
            port,
            timestamp: now,
            ..SocketInfo::vacant(slot)
        };
        self.salts[slot as usize].store(salt, Ordering::Release);
        self.active_per_worker[worker as usize].fetch_add(1, Ordering::Relaxed);
        trace!("Socket slot {} allocated for fd {} (worker {})", slot, fd, worker);
        Ok(session)
    }

    /// True only while `salt` is the slot's current salt.
    #[inline(always)]
    pub fn validate(&self, slot: u32, salt: u64) -> bool {
        salt != INVALID_SALT
            && self
                .salts
                .get(slot as usize)
                .is_some_and(|current| current.load(Ordering::Acquire) == salt)
    }

    /// Frees the slot and returns its last record, or `None` if it was already free.
    pub fn release(&self, slot: u32) -> Option<SocketInfo> {
        let mut info = self.infos.get(slot as usize)?.lock();
        let salt = self.salts[slot as usize].swap(INVALID_SALT, Ordering::AcqRel);
        if salt == INVALID_SALT {
            return None;
        }
        let old = std::mem::replace(&mut *info, SocketInfo::vacant(slot));
        drop(info);
        self.active_per_worker[old.session.worker as usize].fetch_sub(1, Ordering::Relaxed);
        let _ = self.free.push(slot);
        trace!("Socket slot {} released", slot);
        Some(old)
    }

    /// Like `release`, but only while `session` still owns the slot.
    pub fn release_session(&self, session: &Session) -> Option<SocketInfo> {
        if !self.validate(session.slot, session.salt) {
            return None;
        }
        let mut info = self.infos.get(session.slot as usize)?.lock();
        self.salts[session.slot as usize]
            .compare_exchange(session.salt, INVALID_SALT, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let old = std::mem::replace(&mut *info, SocketInfo::vacant(session.slot));
        drop(info);
        self.active_per_worker[old.session.worker as usize].fetch_sub(1, Ordering::Relaxed);
        let _ = self.free.push(session.slot);
        trace!("Socket slot {} released by its owner", session.slot);
        Some(old)
    }

    /// Copy of the record if `session` is still current.
    pub fn get(&self, session: &Session) -> Option<SocketInfo> {
        let info = *self.infos.get(session.slot as usize)?.lock();
        (info.session.salt == session.salt && session.salt != INVALID_SALT).then_some(info)
    }

    /// Copies of every live record, in slot order.
    pub fn occupied(&self) -> Vec<SocketInfo> {
        self.infos
            .iter()
            .enumerate()
            .filter(|(slot, _)| self.salts[*slot].load(Ordering::Acquire) != INVALID_SALT)
            .map(|(_, cell)| *cell.lock())
            .collect()
    }

    /// Mutates the record if `session` is still current.
    pub fn update<R>(&self, session: &Session, f: impl FnOnce(&mut SocketInfo) -> R) -> GatewayResult<R> {
        let mut info = self
            .infos
            .get(session.slot as usize)
            .ok_or(GatewayError::StaleSession)?
            .lock();
        if info.session.salt != session.salt || session.salt == INVALID_SALT {
            return Err(GatewayError::StaleSession);
        }
        Ok(f(&mut info))
    }

    pub fn touch(&self, session: &Session, now: u64) {
        let _ = self.update(session, |info| info.timestamp = now);
    }

    /// Force-releases `worker`'s sockets idle for `timeout` seconds or more.
    /// Slots with a zero timestamp are skipped. Released records are handed
    /// to `on_release` so the owner can close the descriptors.
    pub fn collect_inactive(
        &self,
        worker: u8,
        now: u64,
        timeout: u64,
        mut on_release: impl FnMut(SocketInfo),
    ) -> usize {
        let active = self.active_for_worker(worker);
        let mut seen = 0;
        let mut collected = 0;
        for slot in 0..self.capacity() as u32 {
            if seen >= active {
                break;
            }
            if self.salts[slot as usize].load(Ordering::Acquire) == INVALID_SALT {
                continue;
            }
            let (owner, stamp) = {
                let info = self.infos[slot as usize].lock();
                (info.session.worker, info.timestamp)
            };
            if owner != worker {
                continue;
            }
            seen += 1;
            if stamp == 0 || now.saturating_sub(stamp) < timeout {
                continue;
            }
            if let Some(info) = self.release(slot) {
                debug!("Collecting inactive socket {} (idle {}s)", info.session, now - stamp);
                on_release(info);
                collected += 1;
            }
        }
        collected
    }

    /// Unbinds every socket from a backend that went away. Returns the
    /// affected sessions so their owners can disconnect them.
    pub fn detach_backend(&self, backend: u8) -> Vec<Session> {
        let mut detached = Vec::new();
        for (slot, cell) in self.infos.iter().enumerate() {
            if self.salts[slot].load(Ordering::Acquire) == INVALID_SALT {
                continue;
            }
            let mut info = cell.lock();
            if info.backend == Some(backend) {
                info.backend = None;
                info.flags |= SocketFlags::DISCONNECT_PUSHED_TO_BACKEND;
                detached.push(info.session);
            }
        }
        detached
    }
}
