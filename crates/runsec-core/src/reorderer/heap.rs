use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use super::{ReOrdererMetric, ReOrdererNode, ReOrdererNodePool};

/// Per-CPU min-heaps of buffered events.
///
/// Each partition has its own lock, so producers running on different CPUs
/// never contend with each other. Nodes come from a shared
/// [`ReOrdererNodePool`] and go back to it once delivered.
pub struct ReOrdererHeap {
    partitions: Vec<Mutex<Partition>>,
    pool: Arc<ReOrdererNodePool>,
    seq: AtomicU64,
}

#[derive(Default)]
struct Partition {
    heap: BinaryHeap<Pending>,
}

/// Min-heap adapter ordering nodes by timestamp, then insertion order.
struct Pending(Box<ReOrdererNode>);

impl Pending {
    fn key(&self) -> (u64, u64) {
        (self.0.timestamp, self.0.seq)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap
        other.key().cmp(&self.key())
    }
}

impl ReOrdererHeap {
    /// `partitions` is usually the number of CPUs. Events coming from a
    /// higher CPU index share a partition with `cpu % partitions`.
    pub fn new(partitions: usize, pool: Arc<ReOrdererNodePool>) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| Mutex::new(Partition::default()))
            .collect();
        Self {
            partitions,
            pool,
            seq: AtomicU64::new(0),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    fn partition(&self, index: usize) -> MutexGuard<'_, Partition> {
        self.partitions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn partition_of(&self, cpu: u64) -> usize {
        (cpu % self.partitions.len() as u64) as usize
    }

    /// Buffer a copy of `data`. Never blocks on anything but the partition
    /// lock and the pool free list.
    pub fn enqueue(
        &self,
        cpu: u64,
        data: &[u8],
        timestamp: u64,
        generation: u64,
        metric: &ReOrdererMetric,
    ) {
        let mut node = self.pool.acquire();
        node.cpu = cpu;
        node.timestamp = timestamp;
        node.generation = generation;
        node.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        node.payload.extend_from_slice(data);

        self.partition(self.partition_of(cpu)).heap.push(Pending(node));
        metric.on_enqueue();
    }

    /// Deliver, in ascending timestamp order, every node whose generation is
    /// at most `up_to`. Returns the number of delivered nodes.
    ///
    /// Each partition stops at the first node of a later generation, even if
    /// older generations sit behind it. The sorted runs popped from every
    /// partition are then merged into a single stream.
    pub fn dequeue<F>(&self, mut deliver: F, up_to: u64, metric: &ReOrdererMetric) -> usize
    where
        F: FnMut(u64, &[u8]),
    {
        let mut runs = Vec::with_capacity(self.partitions.len());
        for index in 0..self.partitions.len() {
            let mut partition = self.partition(index);
            let mut run = Vec::new();
            while partition
                .heap
                .peek()
                .is_some_and(|top| top.0.generation <= up_to)
            {
                if let Some(Pending(node)) = partition.heap.pop() {
                    run.push(node);
                }
            }
            if !run.is_empty() {
                // reversed so the oldest node can be popped from the back
                run.reverse();
                runs.push(run);
            }
        }

        let mut heads: BinaryHeap<(std::cmp::Reverse<(u64, u64)>, usize)> = runs
            .iter()
            .enumerate()
            .filter_map(|(index, run)| {
                run.last()
                    .map(|node| (std::cmp::Reverse((node.timestamp, node.seq)), index))
            })
            .collect();

        let mut delivered = 0;
        while let Some((_, index)) = heads.pop() {
            let Some(node) = runs[index].pop() else {
                continue;
            };
            deliver(node.cpu, &node.payload);
            delivered += 1;
            self.pool.release(node);

            if let Some(next) = runs[index].last() {
                heads.push((std::cmp::Reverse((next.timestamp, next.seq)), index));
            }
        }

        metric.on_dequeue(delivered as u64);
        delivered
    }

    /// Drop every buffered node. Returns how many were dropped.
    pub fn discard(&self, metric: &ReOrdererMetric) -> usize {
        let mut discarded = 0;
        for index in 0..self.partitions.len() {
            let nodes = std::mem::take(&mut self.partition(index).heap);
            discarded += nodes.len();
            for Pending(node) in nodes {
                self.pool.release(node);
            }
        }
        metric.on_discard(discarded as u64);
        discarded
    }

    /// Nodes currently buffered across every partition.
    pub fn len(&self) -> usize {
        (0..self.partitions.len())
            .map(|index| self.partition(index).heap.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rand::Rng;

    use super::*;

    fn heap(partitions: usize) -> (ReOrdererHeap, ReOrdererMetric) {
        let pool = Arc::new(ReOrdererNodePool::new(1024));
        (ReOrdererHeap::new(partitions, pool), ReOrdererMetric::new())
    }

    #[test]
    fn random_insertion_drains_sorted() {
        let (heap, metric) = heap(4);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let value: u8 = rng.gen_range(1..=254);
            heap.enqueue(1, &[value], value as u64, 1, &metric);
        }

        let mut drained = Vec::new();
        let count = heap.dequeue(
            |cpu, data| {
                assert_eq!(cpu, 1);
                drained.push(data[0]);
            },
            1,
            &metric,
        );
        assert_eq!(count, 200);
        assert_eq!(drained.len(), 200);
        assert!(drained.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(heap.is_empty());
    }

    #[test]
    fn retention_windows_are_exact() {
        let (heap, metric) = heap(3);
        for i in 0..90u64 {
            let generation = i / 30 + 1;
            heap.enqueue(i % 3, &i.to_ne_bytes(), i, generation, &metric);
        }

        let mut total = 0;
        let mut drained = Vec::new();
        for (up_to, expected) in [(1, 30), (2, 60), (3, 90)] {
            total += heap.dequeue(
                |_, data| drained.push(u64::from_ne_bytes(data.try_into().unwrap())),
                up_to,
                &metric,
            );
            assert_eq!(total, expected);
        }
        assert_eq!(drained, (0..90).collect::<Vec<_>>());
        assert_eq!(metric.snapshot().depth, 0);
    }

    #[test]
    fn partitions_are_merged() {
        let (heap, metric) = heap(2);
        for (cpu, timestamp) in [(0, 5), (1, 1), (0, 2), (1, 4), (0, 3)] {
            heap.enqueue(cpu, &[timestamp as u8], timestamp, 1, &metric);
        }
        let mut drained = Vec::new();
        heap.dequeue(|cpu, data| drained.push((cpu, data[0])), 1, &metric);
        assert_eq!(drained, vec![(1, 1), (0, 2), (0, 3), (1, 4), (0, 5)]);
    }

    #[test]
    fn later_generation_holds_partition() {
        let (heap, metric) = heap(1);
        heap.enqueue(0, b"a", 1, 2, &metric);
        heap.enqueue(0, b"b", 2, 1, &metric);

        assert_eq!(heap.dequeue(|_, _| {}, 1, &metric), 0);
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.dequeue(|_, _| {}, 2, &metric), 2);
    }

    #[test]
    fn empty_partition_contributes_nothing() {
        let (heap, metric) = heap(4);
        heap.enqueue(2, b"x", 1, 1, &metric);
        assert_eq!(heap.dequeue(|cpu, _| assert_eq!(cpu, 2), 1, &metric), 1);
        assert_eq!(heap.dequeue(|_, _| panic!("nothing to deliver"), 1, &metric), 0);
    }

    #[test]
    fn reused_nodes_do_not_leak_payload() {
        let (heap, metric) = heap(1);
        heap.enqueue(0, b"a much longer payload", 1, 1, &metric);
        heap.dequeue(|_, _| {}, 1, &metric);

        heap.enqueue(0, b"abc", 2, 1, &metric);
        let mut delivered = Vec::new();
        heap.dequeue(|_, data| delivered.extend_from_slice(data), 1, &metric);
        assert_eq!(delivered, b"abc");
        assert_eq!(heap.pool.reused(), 1);
    }

    #[test]
    fn discard_everything() {
        let (heap, metric) = heap(2);
        for timestamp in 0..10 {
            heap.enqueue(timestamp % 2, b"x", timestamp, 1, &metric);
        }
        assert_eq!(heap.discard(&metric), 10);
        assert!(heap.is_empty());
        let stats = metric.snapshot();
        assert_eq!(stats.discarded, 10);
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.max_depth, 10);
    }

    #[test]
    fn concurrent_producers() {
        let (heap, metric) = heap(4);
        let (heap, metric) = (Arc::new(heap), Arc::new(metric));
        let handles: Vec<_> = (0..4u64)
            .map(|cpu| {
                let heap = heap.clone();
                let metric = metric.clone();
                thread::spawn(move || {
                    for timestamp in 0..500u64 {
                        heap.enqueue(cpu, &timestamp.to_ne_bytes(), timestamp * 4 + cpu, 1, &metric);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last = None;
        let count = heap.dequeue(
            |_, data| {
                let value = u64::from_ne_bytes(data.try_into().unwrap());
                if let Some(last) = last {
                    assert!(value >= last);
                }
                last = Some(value);
            },
            1,
            &metric,
        );
        assert_eq!(count, 2000);
        assert_eq!(metric.snapshot().enqueued, 2000);
    }
}
