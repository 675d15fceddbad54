mod bpf_sender;
pub mod pathnames;
pub mod program;
mod rlimit;
#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use bpf_sender::{BpfSender, BpfSenderWrapper};
pub use pathnames::{PathKey, PathTable, PathValue, RevisionSink, TableProvider};
pub use program::{Program, ProgramBuilder, ProgramError, RawEvent};
pub use rlimit::bump_memlock_rlimit;

pub use aya;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}
