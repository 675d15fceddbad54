use std::{
    io::{self, Write},
    sync::Arc,
};

use runsec_core::{
    ResolvedEvent,
    bus::{BusError, receive_from_broadcast},
};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{LoggerConfig, OutputFormat};

pub const NAME: &str = "event-logger";

#[derive(Debug, Error)]
enum EventLoggerError {
    #[error("error serializing event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error")]
    IO(#[from] io::Error),
}

/// Prints every resolved event on standard output.
pub struct EventLogger<W> {
    config: LoggerConfig,
    out: W,
}

impl EventLogger<io::Stdout> {
    pub fn stdout(config: LoggerConfig) -> Self {
        Self::new(config, io::stdout())
    }
}

impl<W: Write> EventLogger<W> {
    pub fn new(config: LoggerConfig, out: W) -> Self {
        Self { config, out }
    }

    fn process(&mut self, event: &ResolvedEvent) -> Result<(), EventLoggerError> {
        if !self.config.console {
            return Ok(());
        }
        let out = match self.config.output_format {
            OutputFormat::Plaintext => format!("{event:#}"),
            OutputFormat::Json => serde_json::to_string(event)?,
        };
        writeln!(self.out, "{out}")?;
        Ok(())
    }

    /// Consume the bus until every sender is gone.
    pub async fn run(mut self, mut rx: broadcast::Receiver<Arc<ResolvedEvent>>) {
        loop {
            match receive_from_broadcast(&mut rx, NAME).await {
                Ok(event) => {
                    if let Err(err) = self.process(&event) {
                        bpf_common::log_error("writing event", err);
                    }
                }
                Err(BusError::Stopped) => break,
            }
        }
        log::debug!("{NAME} stopped");
    }
}
