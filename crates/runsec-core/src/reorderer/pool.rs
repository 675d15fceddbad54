use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

/// A buffered event waiting for its generation to be drained.
#[derive(Debug, Default)]
pub struct ReOrdererNode {
    pub cpu: u64,
    pub timestamp: u64,
    pub generation: u64,
    /// Insertion order, breaks ties between equal timestamps.
    pub(crate) seq: u64,
    pub payload: Vec<u8>,
}

impl ReOrdererNode {
    fn reset(&mut self) {
        self.cpu = 0;
        self.timestamp = 0;
        self.generation = 0;
        self.seq = 0;
        self.payload.clear();
    }
}

/// Free list of nodes shared by every producer.
///
/// Released nodes keep their payload allocation but never their content:
/// [`ReOrdererNodePool::release`] clears them before they can be handed out
/// again. At most `max_free` nodes are kept, extra ones are freed.
#[derive(Debug)]
pub struct ReOrdererNodePool {
    free: Mutex<Vec<Box<ReOrdererNode>>>,
    max_free: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl ReOrdererNodePool {
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_free,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self) -> Box<ReOrdererNode> {
        let node = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match node {
            Some(node) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                node
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Box::default()
            }
        }
    }

    pub fn release(&self, mut node: Box<ReOrdererNode>) {
        node.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_free {
            free.push(node);
        }
    }

    /// Nodes ready to be reused.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Nodes allocated because the free list was empty.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}
