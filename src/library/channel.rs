use crate::library::chunk::ChunkChain;
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

/// Whatever the consumer of a channel sleeps on.
pub trait Wake: Send + Sync {
    fn wake(&self);
}

/// Condvar-backed wait primitive used by backend schedulers.
#[derive(Default)]
pub struct Signal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Arc<Signal> {
        Arc::new(Signal::default())
    }

    /// Sleeps until woken or `timeout` passes. Returns whether a wake arrived.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

impl Wake for Signal {
    fn wake(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }
}

/// eventfd a worker's I/O driver keeps a poll on. Writing to it ends the
/// driver's wait early.
pub struct EventWake {
    fd: OwnedFd,
    pending: AtomicBool,
}

impl EventWake {
    pub fn new() -> io::Result<Arc<EventWake>> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Arc::new(EventWake {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            pending: AtomicBool::new(false),
        }))
    }

    #[inline(always)]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    #[inline(always)]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Clears the wake and drains the counter. Returns whether one was pending.
    pub fn take(&self) -> bool {
        let was = self.pending.swap(false, Ordering::AcqRel);
        let mut counter = 0u64;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                size_of::<u64>(),
            )
        };
        was
    }
}

impl Wake for EventWake {
    fn wake(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            let one = 1u64;
            unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    &one as *const u64 as *const libc::c_void,
                    size_of::<u64>(),
                )
            };
        }
    }
}

/// Bounded lock-free ring of chunk chains between one worker and one backend.
pub struct Channel {
    ring: ArrayQueue<ChunkChain>,
    waker: Arc<dyn Wake>,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl Channel {
    pub fn new(capacity: usize, waker: Arc<dyn Wake>) -> Channel {
        Channel {
            ring: ArrayQueue::new(capacity),
            waker,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Never blocks. On a full ring the chain comes back untouched.
    pub fn try_push(&self, chain: ChunkChain) -> Result<(), ChunkChain> {
        self.ring.push(chain)?;
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<ChunkChain> {
        let chain = self.ring.pop()?;
        self.popped.fetch_add(1, Ordering::Relaxed);
        Some(chain)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }
}

/// Both directions for a (worker, backend) pair.
pub struct ChannelPair {
    pub to_backend: Channel,
    pub from_backend: Channel,
}

impl ChannelPair {
    pub fn new(capacity: usize, backend: Arc<dyn Wake>, worker: Arc<dyn Wake>) -> ChannelPair {
        ChannelPair {
            to_backend: Channel::new(capacity, backend),
            from_backend: Channel::new(capacity, worker),
        }
    }
}
