use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every producer and the consumer of a
/// [`super::ReOrdererHeap`].
#[derive(Debug, Default)]
pub struct ReOrdererMetric {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    discarded: AtomicU64,
    depth: AtomicU64,
    max_depth: AtomicU64,
}

impl ReOrdererMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub(crate) fn on_dequeue(&self, count: u64) {
        self.dequeued.fetch_add(count, Ordering::Relaxed);
        self.depth.fetch_sub(count, Ordering::Relaxed);
    }

    pub(crate) fn on_discard(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
        self.depth.fetch_sub(count, Ordering::Relaxed);
    }

    /// A record refused after the reorderer was closed, it never entered
    /// the heap.
    pub(crate) fn on_reject(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReOrdererStats {
        ReOrdererStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Relaxed),
            max_depth: self.max_depth.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReOrdererStats {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Buffered records dropped plus records refused once closed
    pub discarded: u64,
    /// Nodes currently buffered
    pub depth: u64,
    /// Highest depth observed
    pub max_depth: u64,
}
