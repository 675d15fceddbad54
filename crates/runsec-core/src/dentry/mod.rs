//! Path resolution for the dentry keys carried by kernel events.

mod cache;
mod error;
mod resolver;
mod revision;

pub use cache::{DEFAULT_CACHE_SIZE, PathCache};
pub use error::{DentryError, ResolverError};
pub use resolver::{DEFAULT_MAX_PATH_DEPTH, DentryResolver, ResolverConfig, ResolverCounters};
pub use revision::DiscarderRevisions;
