use std::collections::{BTreeMap, HashMap};

use bpf_common::PathValue;

/// Entries kept for each mount when nothing else is configured.
pub const DEFAULT_CACHE_SIZE: usize = 128;

/// Userspace copy of the dentries already walked, one bounded LRU store per
/// mount. Keys ignore the path generation: an entry is dropped through
/// [`PathCache::remove`] when the instrumentation reports a mutation.
#[derive(Debug)]
pub struct PathCache {
    capacity: usize,
    mounts: HashMap<u32, LruStore>,
    evictions: u64,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            mounts: HashMap::new(),
            evictions: 0,
        }
    }

    /// Returns the cached value and marks it as most recently used.
    pub fn get(&mut self, mount_id: u32, inode: u64) -> Option<PathValue> {
        self.mounts.get_mut(&mount_id)?.get(inode)
    }

    pub fn insert(&mut self, mount_id: u32, inode: u64, value: PathValue) {
        let capacity = self.capacity;
        let store = self
            .mounts
            .entry(mount_id)
            .or_insert_with(|| LruStore::new(capacity));
        if store.insert(inode, value) {
            self.evictions += 1;
        }
    }

    pub fn remove(&mut self, mount_id: u32, inode: u64) -> Option<PathValue> {
        self.mounts.get_mut(&mount_id)?.remove(inode)
    }

    /// Drop every entry of a mount. Returns false if nothing was cached for it.
    pub fn remove_mount(&mut self, mount_id: u32) -> bool {
        self.mounts.remove(&mount_id).is_some()
    }

    pub fn contains(&self, mount_id: u32, inode: u64) -> bool {
        self.mounts
            .get(&mount_id)
            .is_some_and(|store| store.entries.contains_key(&inode))
    }

    /// Number of entries cached across all mounts.
    pub fn len(&self) -> usize {
        self.mounts.values().map(|store| store.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mount_len(&self, mount_id: u32) -> usize {
        self.mounts
            .get(&mount_id)
            .map_or(0, |store| store.entries.len())
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

/// LRU map of inode -> value. Every access stamps the entry with a
/// monotonic tick; `recency` indexes the stamps so the oldest entry is the
/// first one in the tree.
#[derive(Debug)]
struct LruStore {
    capacity: usize,
    entries: HashMap<u64, Slot>,
    recency: BTreeMap<u64, u64>,
    clock: u64,
}

#[derive(Debug)]
struct Slot {
    value: PathValue,
    stamp: u64,
}

impl LruStore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, inode: u64) -> Option<PathValue> {
        let stamp = self.tick();
        let slot = self.entries.get_mut(&inode)?;
        self.recency.remove(&slot.stamp);
        slot.stamp = stamp;
        self.recency.insert(stamp, inode);
        Some(slot.value)
    }

    /// Returns true when an older entry was evicted to make room.
    fn insert(&mut self, inode: u64, value: PathValue) -> bool {
        let stamp = self.tick();
        if let Some(slot) = self.entries.get_mut(&inode) {
            self.recency.remove(&slot.stamp);
            slot.value = value;
            slot.stamp = stamp;
            self.recency.insert(stamp, inode);
            return false;
        }

        let mut evicted = false;
        if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.recency.pop_first() {
                self.entries.remove(&oldest);
                evicted = true;
            }
        }
        self.entries.insert(inode, Slot { value, stamp });
        self.recency.insert(stamp, inode);
        evicted
    }

    fn remove(&mut self, inode: u64) -> Option<PathValue> {
        let slot = self.entries.remove(&inode)?;
        self.recency.remove(&slot.stamp);
        Some(slot.value)
    }
}
