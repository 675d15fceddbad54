//! `runsecd` turns the raw file system records of an eBPF probe into ordered,
//! path-resolved events.
//!
//! Records are read from a perf event array, one task per CPU, and pushed into
//! a [reorderer](runsec_core::ReOrderer) which releases them in timestamp order
//! once they are old enough. Every released record has its path keys resolved
//! by the [dentry resolver](runsec_core::DentryResolver) and the resulting
//! [event](runsec_core::ResolvedEvent) is published on the
//! [bus](runsec_core::Bus), where the event logger prints it.
//!
//! Configuration is read from an `INI` file, see [config] for the sections.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod logger;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
