//! Reordering of the per-CPU kernel event streams.
//!
//! Every CPU delivers its own records in order, but the reader tasks run
//! concurrently and the merged stream they produce is not. Records are
//! buffered in a [`ReOrdererHeap`] tagged with the current generation, and
//! a generation is released only once `retention` newer ones have started.

use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use bpf_common::{BpfSender, ProgramError, RawEvent};

mod heap;
mod metric;
mod pool;

pub use heap::ReOrdererHeap;
pub use metric::{ReOrdererMetric, ReOrdererStats};
pub use pool::{ReOrdererNode, ReOrdererNodePool};

pub const DEFAULT_RETENTION: u64 = 5;
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct ReOrdererConfig {
    /// Number of heap partitions, one per CPU
    pub partitions: usize,
    /// Generations a record stays buffered before it can be delivered.
    /// With 0 every tick releases everything, records are not reordered.
    pub retention: u64,
    /// Free nodes kept for reuse
    pub pool_capacity: usize,
}

impl Default for ReOrdererConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            retention: DEFAULT_RETENTION,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

pub struct ReOrderer {
    heap: Arc<ReOrdererHeap>,
    metric: Arc<ReOrdererMetric>,
    generation: Arc<AtomicU64>,
    closed: Arc<RwLock<bool>>,
    retention: u64,
}

impl ReOrderer {
    pub fn new(config: &ReOrdererConfig) -> Self {
        let pool = Arc::new(ReOrdererNodePool::new(config.pool_capacity));
        Self {
            heap: Arc::new(ReOrdererHeap::new(config.partitions, pool)),
            metric: Arc::new(ReOrdererMetric::new()),
            generation: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(RwLock::new(false)),
            retention: config.retention,
        }
    }

    /// Producer handle for [`bpf_common::Program::read_events`].
    pub fn sender(&self) -> ReOrdererSender {
        ReOrdererSender {
            heap: self.heap.clone(),
            metric: self.metric.clone(),
            generation: self.generation.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Refuse every record sent from now on. Once this returns no producer
    /// is in the middle of an enqueue, so a following [`ReOrderer::flush`]
    /// or [`ReOrderer::discard`] sees everything that was accepted.
    /// Refused records are counted as discarded.
    pub fn close(&self) {
        *self.closed.write().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new generation and deliver the ones that left the retention
    /// window.
    pub fn tick<F>(&self, deliver: F) -> usize
    where
        F: FnMut(u64, &[u8]),
    {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if generation < self.retention {
            return 0;
        }
        self.heap
            .dequeue(deliver, generation - self.retention, &self.metric)
    }

    /// Deliver everything still buffered.
    pub fn flush<F>(&self, deliver: F) -> usize
    where
        F: FnMut(u64, &[u8]),
    {
        self.heap.dequeue(deliver, u64::MAX, &self.metric)
    }

    /// Drop everything still buffered and return how many records were lost.
    pub fn discard(&self) -> usize {
        self.heap.discard(&self.metric)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn stats(&self) -> ReOrdererStats {
        self.metric.snapshot()
    }
}

/// [`BpfSender`] buffering raw records in the reorderer heap, tagged with
/// the generation current at reception.
#[derive(Clone)]
pub struct ReOrdererSender {
    heap: Arc<ReOrdererHeap>,
    metric: Arc<ReOrdererMetric>,
    generation: Arc<AtomicU64>,
    closed: Arc<RwLock<bool>>,
}

impl ReOrdererSender {
    pub fn stats(&self) -> ReOrdererStats {
        self.metric.snapshot()
    }
}

impl BpfSender for ReOrdererSender {
    fn send(&mut self, data: Result<RawEvent, ProgramError>) {
        match data {
            Ok(event) => {
                // held across the enqueue, `close` waits for it
                let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
                if *closed {
                    self.metric.on_reject();
                    return;
                }
                let generation = self.generation.load(Ordering::Acquire);
                self.heap.enqueue(
                    event.cpu,
                    &event.buffer,
                    event.timestamp,
                    generation,
                    &self.metric,
                );
            }
            Err(err) => bpf_common::log_error("error reading kernel events", err),
        }
    }
}
