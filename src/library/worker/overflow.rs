use crate::library::{channel::Channel, chunk::ChunkChain, chunk::pool::PrivateChunkPool};
use std::collections::VecDeque;
use tracing::trace;

/// Chains a worker could not push because the target channel was full.
///
/// One FIFO per channel. Once a FIFO holds anything, new chains for the same
/// channel queue behind it instead of trying the channel first, so a
/// connection's messages reach the backend in the order they were sent.
pub struct OverflowQueue {
    queues: Vec<VecDeque<ChunkChain>>,
    queued: usize,
    retries: u64,
}

impl OverflowQueue {
    pub fn new(channels: usize) -> OverflowQueue {
        OverflowQueue {
            queues: (0..channels).map(|_| VecDeque::new()).collect(),
            queued: 0,
            retries: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.queued
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Failed push attempts so far.
    #[inline(always)]
    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn queued_for(&self, channel: usize) -> usize {
        self.queues[channel].len()
    }

    /// Pushes `chain` to `target` unless earlier chains for it are waiting.
    /// Returns true if the chain went out right away.
    pub fn push_or_queue(&mut self, index: usize, target: &Channel, chain: ChunkChain) -> bool {
        let queue = &mut self.queues[index];
        if queue.is_empty() {
            match target.try_push(chain) {
                Ok(()) => return true,
                Err(chain) => {
                    self.retries += 1;
                    queue.push_back(chain);
                }
            }
        } else {
            queue.push_back(chain);
        }
        self.queued += 1;
        trace!("Overflow: channel {} holds {} chains", index, queue.len());
        false
    }

    /// Retries every FIFO in order, stopping at a FIFO's first failure.
    /// `channel` maps a FIFO index to its channel, or `None` if it is gone.
    pub fn flush<'a>(&mut self, channel: impl Fn(usize) -> Option<&'a Channel>) -> usize {
        if self.queued == 0 {
            return 0;
        }
        let mut pushed = 0;
        for (index, queue) in self.queues.iter_mut().enumerate() {
            if queue.is_empty() {
                continue;
            }
            let Some(target) = channel(index) else {
                continue;
            };
            while let Some(chain) = queue.pop_front() {
                match target.try_push(chain) {
                    Ok(()) => pushed += 1,
                    Err(chain) => {
                        self.retries += 1;
                        queue.push_front(chain);
                        break;
                    }
                }
            }
        }
        self.queued -= pushed;
        pushed
    }

    /// Empties one FIFO, e.g. when its backend went away.
    pub fn drain(&mut self, index: usize) -> Vec<ChunkChain> {
        let drained: Vec<ChunkChain> = self.queues[index].drain(..).collect();
        self.queued -= drained.len();
        drained
    }

    pub fn release_all(&mut self, pool: &mut PrivateChunkPool) {
        for index in 0..self.queues.len() {
            for chain in self.drain(index) {
                pool.release(chain);
            }
        }
    }
}
