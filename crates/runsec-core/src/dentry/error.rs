use bpf_common::ProgramError;
use thiserror::Error;

/// Failure to resolve a single path. `TruncatedSegment` and
/// `TruncatedParents` still carry the best-effort path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DentryError {
    #[error("path key {mount_id:x}/{inode:x} not found")]
    NotFound { mount_id: u32, inode: u64 },
    #[error("truncated_segment")]
    TruncatedSegment { path: String },
    #[error("truncated_parents")]
    TruncatedParents { path: String },
    #[error("invalid inode/mountID couple: {inode}/{mount_id}")]
    InvalidKey { mount_id: u32, inode: u64 },
    /// The kernel table itself failed, not just missed the key.
    #[error("path table lookup of {mount_id:x}/{inode:x} failed: {reason}")]
    TableLookup {
        mount_id: u32,
        inode: u64,
        reason: String,
    },
}

impl DentryError {
    /// The partial path of a degraded resolution.
    pub fn partial_path(&self) -> Option<&str> {
        match self {
            DentryError::TruncatedSegment { path } | DentryError::TruncatedParents { path } => {
                Some(path)
            }
            DentryError::NotFound { .. }
            | DentryError::InvalidKey { .. }
            | DentryError::TableLookup { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.partial_path().is_some()
    }
}

#[derive(Error, Debug)]
pub enum ResolverError {
    /// The loaded instrumentation doesn't expose the table. This is a
    /// deployment mismatch, retrying won't help.
    #[error("kernel table {map} not available")]
    StartupFailure {
        map: String,
        #[source]
        source: ProgramError,
    },
    #[error("dentry resolver not started")]
    NotStarted,
}
