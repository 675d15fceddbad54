use std::{env, ffi::OsString, path::PathBuf};

use clap::{ArgAction, Parser};

pub const NAME: &str = "runsecd";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(version = crate::VERSION)]
#[clap(about = "Runtime security event pipeline daemon")]
pub struct RunsecdOpts {
    /// Configuration file, defaults to /var/lib/runsec/runsec.ini
    #[clap(long)]
    pub config_file: Option<PathBuf>,
    /// Pass many times for a more verbose output. Passing `-v` adds debug
    /// logs, `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl RunsecdOpts {
    /// Log level requested on the command line, if any.
    pub fn override_log_level(&self) -> Option<log::LevelFilter> {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

pub fn parse_from_args() -> RunsecdOpts {
    parse_from(env::args_os())
}

pub fn parse_from<I, T>(args: I) -> RunsecdOpts
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    RunsecdOpts::try_parse_from(args).unwrap_or_else(|e| e.exit())
}

fn log_level_from_verbosity_flag_count(num: u8) -> Option<log::LevelFilter> {
    match num {
        0 => None,
        1 => Some(log::LevelFilter::Debug),
        2..=u8::MAX => Some(log::LevelFilter::Trace),
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // `{:?}` prints the whole cause chain, `{:#}` keeps it on one line
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity() {
        let opts = RunsecdOpts::try_parse_from(["runsecd"]).unwrap();
        assert_eq!(opts.override_log_level(), None);
        assert_eq!(opts.config_file, None);

        let opts =
            RunsecdOpts::try_parse_from(["runsecd", "-vv", "--config-file", "/tmp/runsec.ini"])
                .unwrap();
        assert_eq!(opts.override_log_level(), Some(log::LevelFilter::Trace));
        assert_eq!(opts.config_file, Some(PathBuf::from("/tmp/runsec.ini")));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(RunsecdOpts::try_parse_from(["runsecd", "--bogus"]).is_err());
    }
}
