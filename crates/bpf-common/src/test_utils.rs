//! In-memory stand-ins for the kernel tables, usable without loading any
//! eBPF object.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use aya::maps::MapError;

use crate::{
    ProgramError,
    pathnames::{
        MAX_SEGMENT_LENGTH, PathKey, PathTable, PathTableError, PathValue, RevisionSink,
        TableProvider,
    },
};

/// [`PathTable`] over a shared hash map. Clones share the same entries and
/// lookup counter.
#[derive(Clone, Default)]
pub struct MemoryPathTable {
    entries: Arc<Mutex<HashMap<PathKey, PathValue>>>,
    failing: Arc<Mutex<HashSet<PathKey>>>,
    lookups: Arc<AtomicUsize>,
}

impl MemoryPathTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: PathKey, parent: PathKey, name: &str) {
        self.insert_value(key, PathValue::new(parent, name));
    }

    /// Insert a name as the kernel would store it, with every byte of the
    /// buffer available (no room left for the terminator).
    pub fn insert_raw(&self, key: PathKey, parent: PathKey, name: [u8; MAX_SEGMENT_LENGTH + 1]) {
        self.insert_value(key, PathValue { parent, name });
    }

    pub fn insert_value(&self, key: PathKey, value: PathValue) {
        self.entries.lock().unwrap().insert(key, value);
    }

    pub fn remove(&self, key: &PathKey) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Make every lookup of `key` fail like a broken map syscall.
    pub fn fail_on(&self, key: PathKey) {
        self.failing.lock().unwrap().insert(key);
    }

    /// Number of lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl PathTable for MemoryPathTable {
    fn lookup(&self, key: &PathKey) -> Result<Option<PathValue>, PathTableError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(key) {
            return Err(MapError::OutOfBounds {
                index: 0,
                max_entries: 0,
            }
            .into());
        }
        Ok(self.entries.lock().unwrap().get(key).copied())
    }
}

/// [`RevisionSink`] remembering the last published revision of every mount.
#[derive(Clone, Default)]
pub struct MemoryRevisionMap {
    revisions: Arc<Mutex<HashMap<u32, u32>>>,
}

impl MemoryRevisionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mount_id: u32) -> Option<u32> {
        self.revisions.lock().unwrap().get(&mount_id).copied()
    }
}

impl RevisionSink for MemoryRevisionMap {
    fn publish(&self, mount_id: u32, revision: u32) -> Result<(), PathTableError> {
        self.revisions.lock().unwrap().insert(mount_id, revision);
        Ok(())
    }
}

/// [`TableProvider`] serving in-memory tables under fixed names. A missing
/// table behaves like a map absent from the loaded object.
#[derive(Default)]
pub struct MemoryTables {
    path_tables: HashMap<String, MemoryPathTable>,
    revision_maps: HashMap<String, MemoryRevisionMap>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path_table(mut self, name: &str, table: MemoryPathTable) -> Self {
        self.path_tables.insert(name.to_string(), table);
        self
    }

    pub fn with_revision_map(mut self, name: &str, map: MemoryRevisionMap) -> Self {
        self.revision_maps.insert(name.to_string(), map);
        self
    }
}

impl TableProvider for MemoryTables {
    fn path_table(&mut self, name: &str) -> Result<Box<dyn PathTable>, ProgramError> {
        self.path_tables
            .get(name)
            .map(|table| Box::new(table.clone()) as Box<dyn PathTable>)
            .ok_or_else(|| ProgramError::MapNotFound(name.to_string()))
    }

    fn revision_map(&mut self, name: &str) -> Result<Box<dyn RevisionSink>, ProgramError> {
        self.revision_maps
            .get(name)
            .map(|map| Box::new(map.clone()) as Box<dyn RevisionSink>)
            .ok_or_else(|| ProgramError::MapNotFound(name.to_string()))
    }
}
