//! Composition of the reorderer and the dentry resolver.
//!
//! Per-CPU reader tasks push raw records through the [`ReOrdererSender`].
//! A single consumer task ticks the reorderer, resolves the path keys of
//! every record it releases, applies the cache invalidations implied by
//! filesystem mutations and publishes the result on the [`Bus`].

use std::{sync::Arc, time::Duration};

use bpf_common::{PathKey, RevisionSink};
use strum::{Display, EnumString};
use tokio::time::MissedTickBehavior;

use crate::{
    bus::Bus,
    dentry::{DentryResolver, ResolverConfig, ResolverCounters, ResolverError},
    event::{EventHeader, EventKind, ResolutionTag, ResolvedEvent},
    reorderer::{ReOrderer, ReOrdererConfig, ReOrdererSender, ReOrdererStats},
    shutdown::ShutdownSignal,
};

/// What happens to records still buffered when the pipeline stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Deliver them, in order
    #[default]
    Drain,
    /// Drop them and log how many were lost
    Discard,
}

/// What happens to events whose path could not be resolved at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorPolicy {
    /// Forward them with their [`ResolutionTag`]
    #[default]
    Annotate,
    /// Drop them. Degraded paths are still forwarded.
    Drop,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tick_interval: Duration,
    /// Ticks between two stats log lines, 0 disables them
    pub stats_interval: u64,
    pub reorderer: ReOrdererConfig,
    pub resolver: ResolverConfig,
    pub shutdown_policy: ShutdownPolicy,
    pub on_resolution_error: ErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            stats_interval: 100,
            reorderer: ReOrdererConfig::default(),
            resolver: ResolverConfig::default(),
            shutdown_policy: ShutdownPolicy::default(),
            on_resolution_error: ErrorPolicy::default(),
        }
    }
}

/// Counters of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Events published on the bus
    pub delivered: u64,
    /// Events dropped by [`ErrorPolicy::Drop`]
    pub dropped: u64,
    /// Records discarded at shutdown or refused once closed
    pub discarded: u64,
    pub reorderer: ReOrdererStats,
    pub resolver: ResolverCounters,
}

pub struct EventPipeline {
    reorderer: ReOrderer,
    consumer: Consumer,
    revision_sink: Option<Box<dyn RevisionSink>>,
    tick_interval: Duration,
    stats_interval: u64,
    shutdown_policy: ShutdownPolicy,
    ticks: u64,
}

impl EventPipeline {
    pub fn new(config: &PipelineConfig, resolver: Arc<DentryResolver>, bus: Bus) -> Self {
        Self {
            reorderer: ReOrderer::new(&config.reorderer),
            consumer: Consumer {
                resolver,
                bus,
                policy: config.on_resolution_error,
                delivered: 0,
                dropped: 0,
            },
            revision_sink: None,
            tick_interval: config.tick_interval,
            stats_interval: config.stats_interval,
            shutdown_policy: config.shutdown_policy,
            ticks: 0,
        }
    }

    /// Where discarder revision bumps are published.
    pub fn with_revision_sink(mut self, sink: Box<dyn RevisionSink>) -> Self {
        self.revision_sink = Some(sink);
        self
    }

    pub fn sender(&self) -> ReOrdererSender {
        self.reorderer.sender()
    }

    pub fn resolver(&self) -> &Arc<DentryResolver> {
        &self.consumer.resolver
    }

    /// Advance the reorderer by one generation, handle every released
    /// record and publish pending revision bumps. Returns the number of
    /// records released.
    pub fn tick(&mut self) -> usize {
        let released = self
            .reorderer
            .tick(|cpu, data| self.consumer.handle(cpu, data));
        self.publish_revisions();

        self.ticks += 1;
        if self.stats_interval > 0 && self.ticks % self.stats_interval == 0 {
            let report = self.report();
            log::debug!(
                "delivered={} dropped={} buffered={} max_buffered={} cache_hits={} cache_misses={} table_misses={}",
                report.delivered,
                report.dropped,
                report.reorderer.depth,
                report.reorderer.max_depth,
                report.resolver.cache_hits,
                report.resolver.cache_misses,
                report.resolver.table_misses,
            );
        }
        released
    }

    /// Tick until `shutdown` fires, then stop the pipeline.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<PipelineReport, ResolverError> {
        if !self.consumer.resolver.is_started() {
            return Err(ResolverError::NotStarted);
        }

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
        Ok(self.shutdown())
    }

    /// Close the reorderer and apply the shutdown policy to the buffered
    /// records, then release the kernel table. Records sent after this
    /// call are refused and counted as discarded in the reorderer stats.
    pub fn shutdown(mut self) -> PipelineReport {
        self.reorderer.close();
        match self.shutdown_policy {
            ShutdownPolicy::Drain => {
                let drained = self
                    .reorderer
                    .flush(|cpu, data| self.consumer.handle(cpu, data));
                log::debug!("drained {drained} buffered events");
            }
            ShutdownPolicy::Discard => {
                let discarded = self.reorderer.discard();
                if discarded > 0 {
                    log::warn!("discarded {discarded} buffered events");
                }
            }
        }
        self.publish_revisions();
        self.consumer.resolver.stop();
        self.report()
    }

    fn publish_revisions(&self) {
        let dirty = self.consumer.resolver.revisions().take_dirty();
        let Some(sink) = &self.revision_sink else {
            return;
        };
        for (mount_id, revision) in dirty {
            if let Err(err) = sink.publish(mount_id, revision) {
                bpf_common::log_error(
                    &format!("publishing revision {revision} of mount {mount_id}"),
                    err,
                );
            }
        }
    }

    fn report(&self) -> PipelineReport {
        let reorderer = self.reorderer.stats();
        PipelineReport {
            delivered: self.consumer.delivered,
            dropped: self.consumer.dropped,
            discarded: reorderer.discarded,
            reorderer,
            resolver: self.consumer.resolver.stats(),
        }
    }
}

/// Resolution side of the pipeline, split out so it can be borrowed while
/// the reorderer drains.
struct Consumer {
    resolver: Arc<DentryResolver>,
    bus: Bus,
    policy: ErrorPolicy,
    delivered: u64,
    dropped: u64,
}

impl Consumer {
    fn handle(&mut self, cpu: u64, data: &[u8]) {
        let event = match EventHeader::parse(data) {
            Ok(header) => self.resolve(cpu, &header),
            Err(err) => {
                log::debug!("malformed record on cpu {cpu}: {err}");
                ResolvedEvent::malformed(cpu, data)
            }
        };

        if self.policy == ErrorPolicy::Drop && event.is_unresolved() {
            self.dropped += 1;
            return;
        }
        self.delivered += 1;
        self.bus.send(event);
    }

    fn resolve(&self, cpu: u64, header: &EventHeader) -> ResolvedEvent {
        let mut event = ResolvedEvent::new(cpu, header.timestamp, header.kind);
        let Some(key) = header.primary else {
            return event;
        };
        event.mount_id = key.mount_id;
        event.inode = key.inode;

        match header.kind {
            EventKind::Umount => {
                self.resolver.del_cache_entries(key.mount_id);
                event.discarder_revision = Some(self.resolver.revisions().bump(key.mount_id));
            }
            EventKind::Rename => {
                event.path = self.path_of(&mut event, key);
                // the inode keeps its number, drop the old name before
                // looking up the new one
                self.resolver.del_cache_entry(key.mount_id, key.inode);
                if let Some(destination) = header.secondary {
                    event.destination = self.path_of(&mut event, destination);
                }
            }
            kind => {
                event.path = self.path_of(&mut event, key);
                if kind.is_removal() {
                    self.resolver.del_cache_entry(key.mount_id, key.inode);
                    if event.path.is_some() {
                        event.discarder_revision =
                            Some(self.resolver.revisions().bump(key.mount_id));
                    }
                }
            }
        }
        event
    }

    /// Full or partial path of `key`, tagging `event` on failure.
    fn path_of(&self, event: &mut ResolvedEvent, key: PathKey) -> Option<String> {
        match self.resolver.resolve(key.mount_id, key.inode, key.path_id) {
            Ok(path) => Some(path),
            Err(err) => {
                log::debug!("resolving {key} failed: {err}");
                event.tag(ResolutionTag::from(&err));
                err.partial_path().map(str::to_string)
            }
        }
    }
}
