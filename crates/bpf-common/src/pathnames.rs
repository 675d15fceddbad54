//! Kernel-side dentry tables.
//!
//! The instrumentation layer maintains a `pathnames` hash map where every
//! dentry it walked is stored as `PathKey -> PathValue`. Userspace only reads
//! it: names are rebuilt by following the `parent` links up to the root.
//!
//! Both structures are `#[repr(C)]` and shared byte-for-byte with the eBPF
//! side, so their layout must not change:
//!
//! ```text
//! PathKey   (16 bytes)  | inode: u64 | mount_id: u32 | path_id: u32 |
//! PathValue (144 bytes) | parent: PathKey | name: [u8; 128] (NUL padded) |
//! ```
//!
//! All integers are in host byte order.

use std::{ffi::CStr, fmt, sync::Mutex};

use aya::maps::{HashMap, MapData, MapError};
use thiserror::Error;

/// Longest name segment the kernel stores. One more byte is reserved for the
/// trailing NUL.
pub const MAX_SEGMENT_LENGTH: usize = 127;

/// Size of an encoded [`PathKey`].
pub const PATH_KEY_SIZE: usize = 16;

/// Upper 32 bits of the placeholder inodes the kernel allocates while a
/// rename is in flight.
pub const FAKE_INODE_MSW: u64 = 0xdeadc001;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct PathKey {
    pub inode: u64,
    pub mount_id: u32,
    pub path_id: u32,
}

// SAFETY: plain old data, no padding.
unsafe impl aya::Pod for PathKey {}

impl PathKey {
    pub const fn new(mount_id: u32, inode: u64, path_id: u32) -> Self {
        Self {
            inode,
            mount_id,
            path_id,
        }
    }

    /// A key with both inode and mount id set to zero terminates every
    /// parent chain and is never a valid lookup key.
    pub fn is_null(&self) -> bool {
        self.inode == 0 && self.mount_id == 0
    }

    /// Rename placeholders must never be cached.
    pub fn is_fake(&self) -> bool {
        self.inode >> 32 == FAKE_INODE_MSW
    }

    /// Encode the key in its 16 bytes wire form.
    pub fn write(&self, buffer: &mut [u8; PATH_KEY_SIZE]) {
        buffer[0..8].copy_from_slice(&self.inode.to_ne_bytes());
        buffer[8..12].copy_from_slice(&self.mount_id.to_ne_bytes());
        buffer[12..16].copy_from_slice(&self.path_id.to_ne_bytes());
    }

    /// Decode a key from the start of `bytes`. Returns `None` when fewer than
    /// 16 bytes are available.
    pub fn read(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; PATH_KEY_SIZE] = bytes.get(..PATH_KEY_SIZE)?.try_into().ok()?;
        let [i0, i1, i2, i3, i4, i5, i6, i7, m0, m1, m2, m3, p0, p1, p2, p3] = *bytes;
        Some(Self {
            inode: u64::from_ne_bytes([i0, i1, i2, i3, i4, i5, i6, i7]),
            mount_id: u32::from_ne_bytes([m0, m1, m2, m3]),
            path_id: u32::from_ne_bytes([p0, p1, p2, p3]),
        })
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}/{:x}", self.mount_id, self.inode)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PathValue {
    pub parent: PathKey,
    pub name: [u8; MAX_SEGMENT_LENGTH + 1],
}

// SAFETY: plain old data, no padding.
unsafe impl aya::Pod for PathValue {}

impl Default for PathValue {
    fn default() -> Self {
        Self {
            parent: PathKey::default(),
            name: [0; MAX_SEGMENT_LENGTH + 1],
        }
    }
}

impl PathValue {
    /// Build a value from a name, truncating it to the kernel capacity.
    pub fn new(parent: PathKey, name: &str) -> Self {
        let mut value = Self {
            parent,
            ..Default::default()
        };
        let len = name.len().min(MAX_SEGMENT_LENGTH);
        value.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        value
    }

    /// Name bytes up to the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        match CStr::from_bytes_until_nul(&self.name) {
            Ok(name) => name.to_bytes(),
            // every byte is set, the terminator was overwritten
            Err(_) => &self.name,
        }
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    /// The kernel writes an empty name when it could not read the dentry,
    /// which means the ancestors above this entry are missing.
    pub fn is_empty(&self) -> bool {
        self.name[0] == 0
    }

    /// The mount root is stored as `/` and doesn't contribute a segment.
    pub fn is_root(&self) -> bool {
        self.name[0] == b'/'
    }

    /// The kernel cuts names at `MAX_SEGMENT_LENGTH`, so a name of that
    /// length may have been longer.
    pub fn is_truncated(&self) -> bool {
        self.name_bytes().len() >= MAX_SEGMENT_LENGTH
    }
}

impl fmt::Debug for PathValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathValue")
            .field("parent", &self.parent)
            .field("name", &self.name())
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum PathTableError {
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Read access to the kernel `pathnames` table.
pub trait PathTable: Send + Sync {
    /// Returns `Ok(None)` when the key is not present.
    fn lookup(&self, key: &PathKey) -> Result<Option<PathValue>, PathTableError>;
}

/// Write access to the table the instrumentation layer reads discarder
/// revisions from.
pub trait RevisionSink: Send + Sync {
    fn publish(&self, mount_id: u32, revision: u32) -> Result<(), PathTableError>;
}

/// Something able to hand out the kernel tables, usually a loaded
/// [`crate::Program`].
pub trait TableProvider {
    fn path_table(&mut self, name: &str) -> Result<Box<dyn PathTable>, crate::ProgramError>;

    fn revision_map(&mut self, name: &str) -> Result<Box<dyn RevisionSink>, crate::ProgramError>;
}

/// [`PathTable`] backed by a `BPF_MAP_TYPE_HASH`.
pub struct KernelPathTable {
    map: HashMap<MapData, PathKey, PathValue>,
}

impl KernelPathTable {
    pub fn new(map: HashMap<MapData, PathKey, PathValue>) -> Self {
        Self { map }
    }
}

impl PathTable for KernelPathTable {
    fn lookup(&self, key: &PathKey) -> Result<Option<PathValue>, PathTableError> {
        match self.map.get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// [`RevisionSink`] backed by a `BPF_MAP_TYPE_HASH` of `mount_id -> revision`.
pub struct KernelRevisionMap {
    map: Mutex<HashMap<MapData, u32, u32>>,
}

impl KernelRevisionMap {
    pub fn new(map: HashMap<MapData, u32, u32>) -> Self {
        Self {
            map: Mutex::new(map),
        }
    }
}

impl RevisionSink for KernelRevisionMap {
    fn publish(&self, mount_id: u32, revision: u32) -> Result<(), PathTableError> {
        // a poisoned lock only means another publisher panicked mid-insert,
        // the map itself is still consistent
        let mut map = self.map.lock().unwrap_or_else(|err| err.into_inner());
        map.insert(mount_id, revision, 0)?;
        Ok(())
    }
}
