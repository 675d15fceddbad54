use std::sync::{
    Mutex, MutexGuard, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use bpf_common::{PathKey, PathTable, PathValue, TableProvider};

use super::{
    DEFAULT_CACHE_SIZE, DentryError, DiscarderRevisions, PathCache, ResolverError,
};

/// Deepest parent chain walked before giving up. Protects against cycles
/// in a corrupted table.
pub const DEFAULT_MAX_PATH_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Entries cached per mount
    pub cache_size: usize,
    /// Longest parent chain followed
    pub max_path_depth: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            max_path_depth: DEFAULT_MAX_PATH_DEPTH,
        }
    }
}

/// Rebuilds absolute paths from `(mount_id, inode, path_id)` keys.
///
/// Lookups try the process-local [`PathCache`] first and fall back to the
/// kernel `pathnames` table, copying every entry found there back into the
/// cache. The cache is invalidated by the consumer of filesystem mutation
/// events through [`DentryResolver::del_cache_entry`] and
/// [`DentryResolver::del_cache_entries`].
pub struct DentryResolver {
    table: RwLock<Option<Box<dyn PathTable>>>,
    cache: Mutex<PathCache>,
    revisions: DiscarderRevisions,
    max_depth: usize,
    stats: ResolverStats,
}

impl DentryResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            table: RwLock::new(None),
            cache: Mutex::new(PathCache::new(config.cache_size)),
            revisions: DiscarderRevisions::new(),
            max_depth: config.max_path_depth.max(1),
            stats: ResolverStats::default(),
        }
    }

    /// Bind the resolver to the kernel table called `map_name`.
    pub fn start(
        &self,
        provider: &mut impl TableProvider,
        map_name: &str,
    ) -> Result<(), ResolverError> {
        let table = provider
            .path_table(map_name)
            .map_err(|source| ResolverError::StartupFailure {
                map: map_name.to_string(),
                source,
            })?;
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Some(table);
        log::debug!("dentry resolver bound to {map_name}");
        Ok(())
    }

    /// Release the kernel table. Later resolutions only use the cache.
    pub fn stop(&self) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_started(&self) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn revisions(&self) -> &DiscarderRevisions {
        &self.revisions
    }

    pub fn stats(&self) -> ResolverCounters {
        self.stats.snapshot()
    }

    /// Resolve the absolute path of a dentry.
    pub fn resolve(&self, mount_id: u32, inode: u64, path_id: u32) -> Result<String, DentryError> {
        if PathKey::new(mount_id, inode, path_id).is_null() {
            return Err(DentryError::InvalidKey { mount_id, inode });
        }
        match self.resolve_from_cache(mount_id, inode) {
            Some(path) => Ok(path),
            None => self.resolve_from_map(mount_id, inode, path_id),
        }
    }

    /// Mount id and inode of the parent of a dentry.
    pub fn get_parent(
        &self,
        mount_id: u32,
        inode: u64,
        path_id: u32,
    ) -> Result<(u32, u64), DentryError> {
        let value = self.lookup(PathKey::new(mount_id, inode, path_id))?;
        Ok((value.parent.mount_id, value.parent.inode))
    }

    /// Name of a single dentry, empty on any failure. Use
    /// [`DentryResolver::resolve`] when the error matters.
    pub fn get_name(&self, mount_id: u32, inode: u64, path_id: u32) -> String {
        self.lookup(PathKey::new(mount_id, inode, path_id))
            .map(|value| value.name())
            .unwrap_or_default()
    }

    /// Remove a dentry and its cached ancestors.
    ///
    /// This is not reference counting: ancestors shared with other cached
    /// entries are dropped too, and they will be fetched again from the
    /// kernel table on their next use. The walk stops at the first missing
    /// entry or at a null parent.
    pub fn del_cache_entry(&self, mount_id: u32, inode: u64) {
        let mut cache = self.cache();
        let mut key = PathKey::new(mount_id, inode, 0);
        for _ in 0..self.max_depth {
            let Some(value) = cache.remove(key.mount_id, key.inode) else {
                break;
            };
            if value.parent.inode == 0 {
                break;
            }
            key = value.parent;
        }
    }

    /// Drop every cached dentry of a mount.
    pub fn del_cache_entries(&self, mount_id: u32) {
        if self.cache().remove_mount(mount_id) {
            log::debug!("dropped dentry cache of mount {mount_id}");
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache().len()
    }

    pub fn is_cached(&self, mount_id: u32, inode: u64) -> bool {
        self.cache().contains(mount_id, inode)
    }

    fn cache(&self) -> MutexGuard<'_, PathCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Single entry lookup, cache first. Entries found in the table are not
    /// cached: only full resolutions populate the cache.
    fn lookup(&self, key: PathKey) -> Result<PathValue, DentryError> {
        let not_found = DentryError::NotFound {
            mount_id: key.mount_id,
            inode: key.inode,
        };
        if key.is_null() {
            return Err(DentryError::InvalidKey {
                mount_id: key.mount_id,
                inode: key.inode,
            });
        }
        if let Some(value) = self.cache().get(key.mount_id, key.inode) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let Some(table) = table.as_ref() else {
            return Err(not_found);
        };
        self.lookup_table(table.as_ref(), &key)?.ok_or(not_found)
    }

    /// A miss is `Ok(None)`. A failing table is an error of its own, it must
    /// not pass for a missing or truncated path.
    fn lookup_table(
        &self,
        table: &dyn PathTable,
        key: &PathKey,
    ) -> Result<Option<PathValue>, DentryError> {
        let value = table.lookup(key).map_err(|err| {
            log::debug!("looking up {key} in the path table failed: {err}");
            DentryError::TableLookup {
                mount_id: key.mount_id,
                inode: key.inode,
                reason: err.to_string(),
            }
        })?;
        let counter = match value {
            Some(_) => &self.stats.table_hits,
            None => &self.stats.table_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    /// Walk the parent chain using cached entries only. Any missing link
    /// aborts the walk, the caller then retries against the kernel table.
    fn resolve_from_cache(&self, mount_id: u32, inode: u64) -> Option<String> {
        let mut cache = self.cache();
        let mut key = PathKey::new(mount_id, inode, 0);
        let mut segments = Vec::new();
        for _ in 0..self.max_depth {
            let Some(value) = cache.get(key.mount_id, key.inode) else {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);

            if !value.is_empty() && !value.is_root() {
                segments.push(value.name());
            }
            if value.parent.inode == 0 {
                return Some(join_segments(&segments));
            }
            key = value.parent;
        }
        // too deep for a sane cache content, let the table walk decide
        None
    }

    fn resolve_from_map(
        &self,
        mount_id: u32,
        inode: u64,
        path_id: u32,
    ) -> Result<String, DentryError> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let Some(table) = table.as_ref() else {
            log::debug!("path table not bound, cannot resolve {mount_id:x}/{inode:x}");
            return Err(DentryError::NotFound { mount_id, inode });
        };

        let mut key = PathKey::new(mount_id, inode, path_id);
        let mut segments = Vec::new();
        let mut to_add = Vec::new();
        let mut truncated_segment = false;
        let mut truncated_parents = false;

        loop {
            if to_add.len() == self.max_depth {
                truncated_parents = true;
                break;
            }
            let Some(value) = self.lookup_table(table.as_ref(), &key)? else {
                if to_add.is_empty() {
                    return Err(DentryError::NotFound { mount_id, inode });
                }
                // an ancestor was evicted from the kernel table
                truncated_parents = true;
                break;
            };
            to_add.push((key, value));

            if value.is_empty() {
                truncated_parents = true;
                break;
            }
            if !value.is_root() {
                truncated_segment |= value.is_truncated();
                segments.push(value.name());
            }
            if value.parent.inode == 0 {
                break;
            }
            key = value.parent;
        }
        drop(table);

        let path = join_segments(&segments);
        if truncated_parents {
            return Err(DentryError::TruncatedParents { path });
        }
        if truncated_segment {
            return Err(DentryError::TruncatedSegment { path });
        }

        let mut cache = self.cache();
        for (key, value) in to_add {
            // rename placeholders are short lived, never cache them
            if !key.is_fake() {
                cache.insert(key.mount_id, key.inode, value);
            }
        }
        Ok(path)
    }
}

/// Segments are collected leaf first.
fn join_segments(segments: &[String]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let len = segments.iter().map(|segment| segment.len() + 1).sum();
    let mut path = String::with_capacity(len);
    for segment in segments.iter().rev() {
        path.push('/');
        path.push_str(segment);
    }
    path
}

#[derive(Debug, Default)]
struct ResolverStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    table_hits: AtomicU64,
    table_misses: AtomicU64,
}

impl ResolverStats {
    fn snapshot(&self) -> ResolverCounters {
        ResolverCounters {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            table_hits: self.table_hits.load(Ordering::Relaxed),
            table_misses: self.table_misses.load(Ordering::Relaxed),
        }
    }
}

/// Hits and misses of both resolution tiers, counted per dentry visited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverCounters {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub table_hits: u64,
    pub table_misses: u64,
}
