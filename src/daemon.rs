use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use bpf_common::{
    BpfSenderWrapper, ProgramBuilder, RawEvent, TableProvider,
    program::{BpfContext, BpfLogLevel},
};
use nix::unistd::geteuid;
use runsec_core::{Bus, DentryResolver, EventPipeline, ShutdownSignal};
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    cli::RunsecdOpts,
    config::{EVENT_LOGGER, LoggerConfig, RunsecConfig},
    logger::EventLogger,
};

/// Name of the instrumentation, used in reader logs.
const PROBE_NAME: &str = "runsec";

pub async fn runsecd_run(options: &RunsecdOpts) -> Result<()> {
    log::trace!("runsecd options: {:?}", options);

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    bpf_common::bump_memlock_rlimit()?;

    let config = match &options.config_file {
        Some(custom_file) => RunsecConfig::with_custom_file(custom_file.clone())?,
        None => RunsecConfig::new()?,
    };
    log::debug!("configuration loaded from {}", config.config_file().display());
    let general = config.general().context("Invalid [general] section")?;
    let pipeline_config = config.pipeline().context("Invalid pipeline configuration")?;
    let logger_config = LoggerConfig::try_from(&config.section(EVENT_LOGGER))
        .context("Invalid [event-logger] section")?;

    let probe = tokio::fs::read(&general.probe_object)
        .await
        .with_context(|| format!("Error reading {}", general.probe_object.display()))?;
    let ctx = BpfContext::new(general.pin_path.clone(), general.perf_pages, bpf_log_level());
    let mut program = general
        .attach
        .iter()
        .cloned()
        .fold(ProgramBuilder::new(ctx, PROBE_NAME, probe), |builder, spec| {
            builder.program(spec)
        })
        .start()
        .await
        .context("Error loading the instrumentation")?;

    // A missing path table means the object doesn't match this daemon
    let resolver = Arc::new(DentryResolver::new(&pipeline_config.resolver));
    resolver.start(&mut program, &general.pathnames_map)?;

    let bus = Bus::new();
    let logger = tokio::spawn(EventLogger::stdout(logger_config).run(bus.get_receiver()));

    let mut pipeline = EventPipeline::new(&pipeline_config, resolver, bus);
    match program.revision_map(&general.revisions_map) {
        Ok(sink) => pipeline = pipeline.with_revision_sink(sink),
        Err(err) => {
            bpf_common::log_error("discarder revisions will not be published", err);
        }
    }

    let sender = BpfSenderWrapper::new(pipeline.sender(), |event: &RawEvent| {
        log::trace!("{event}");
    });
    program
        .read_events(&general.events_map, sender)
        .await
        .with_context(|| format!("Error reading {}", general.events_map))?;

    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    let pipeline = tokio::spawn(pipeline.run(shutdown));
    log::info!("runsecd started");

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
    }

    log::info!("Terminating runsecd...");
    // no reader may still be sending when the pipeline drains
    program.stop().await;
    tx_shutdown.send_signal();

    let report = pipeline.await.context("Pipeline task failed")??;
    log::info!(
        "delivered {} events, dropped {}, discarded {}",
        report.delivered,
        report.dropped,
        report.discarded
    );
    log::debug!("{report:?}");

    logger.await.context("Event logger task failed")?;
    Ok(())
}

fn bpf_log_level() -> BpfLogLevel {
    match log::max_level() {
        log::LevelFilter::Debug | log::LevelFilter::Trace => BpfLogLevel::Debug,
        log::LevelFilter::Off => BpfLogLevel::Disabled,
        _ => BpfLogLevel::Error,
    }
}
