//! Userspace side of the runtime security event pipeline: reordering of
//! the per-CPU kernel streams and resolution of the dentry keys they carry.

pub mod bus;
pub mod config;
pub mod dentry;
pub mod event;
pub mod pipeline;
pub mod reorderer;
pub mod shutdown;

pub use bus::Bus;
pub use config::{ConfigError, SectionConfig};
pub use dentry::{DentryError, DentryResolver, ResolverConfig, ResolverError};
pub use event::{EventKind, ResolutionTag, ResolvedEvent};
pub use pipeline::{ErrorPolicy, EventPipeline, PipelineConfig, PipelineReport, ShutdownPolicy};
pub use reorderer::{ReOrderer, ReOrdererConfig, ReOrdererSender};
pub use shutdown::{CleanExit, ShutdownSender, ShutdownSignal};
