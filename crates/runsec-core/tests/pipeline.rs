use std::{sync::Arc, time::Duration};

use bpf_common::{
    BpfSender, PathKey, RawEvent,
    pathnames::PATH_KEY_SIZE,
    test_utils::{MemoryPathTable, MemoryRevisionMap, MemoryTables},
};
use runsec_core::{
    Bus, DentryResolver, EventKind, EventPipeline, PipelineConfig, ReOrdererConfig,
    ResolutionTag, ResolverConfig, ResolverError, ShutdownPolicy, ShutdownSignal,
    bus::receive_from_broadcast,
};

const MOUNT: u32 = 12;
const OPEN: u32 = 1;
const UNLINK: u32 = 3;

fn record(timestamp: u64, kind: u32, keys: &[PathKey]) -> RawEvent {
    let mut data = Vec::new();
    data.extend_from_slice(&timestamp.to_ne_bytes());
    data.extend_from_slice(&kind.to_ne_bytes());
    data.extend_from_slice(&[0; 4]);
    for key in keys {
        let mut buffer = [0; PATH_KEY_SIZE];
        key.write(&mut buffer);
        data.extend_from_slice(&buffer);
    }
    RawEvent {
        cpu: 0,
        timestamp,
        buffer: data.into(),
    }
}

fn on_cpu(cpu: u64, mut event: RawEvent) -> Result<RawEvent, bpf_common::ProgramError> {
    event.cpu = cpu;
    Ok(event)
}

/// / -> var -> log -> {syslog, auth.log}
fn tables() -> (MemoryTables, MemoryPathTable, MemoryRevisionMap) {
    let table = MemoryPathTable::new();
    let root = PathKey::new(MOUNT, 2, 0);
    let var = PathKey::new(MOUNT, 3, 0);
    let log = PathKey::new(MOUNT, 4, 0);
    table.insert(root, PathKey::default(), "/");
    table.insert(var, root, "var");
    table.insert(log, var, "log");
    table.insert(PathKey::new(MOUNT, 5, 0), log, "syslog");
    table.insert(PathKey::new(MOUNT, 6, 0), log, "auth.log");

    let revisions = MemoryRevisionMap::new();
    let tables = MemoryTables::new()
        .with_path_table("pathnames", table.clone())
        .with_revision_map("discarder_revisions", revisions.clone());
    (tables, table, revisions)
}

fn config(retention: u64, shutdown_policy: ShutdownPolicy) -> PipelineConfig {
    PipelineConfig {
        tick_interval: Duration::from_millis(5),
        reorderer: ReOrdererConfig {
            partitions: 2,
            retention,
            ..Default::default()
        },
        shutdown_policy,
        ..Default::default()
    }
}

#[tokio::test]
async fn events_are_ordered_and_resolved() {
    let (mut tables, table, revisions) = tables();
    let resolver = Arc::new(DentryResolver::new(&ResolverConfig::default()));
    resolver.start(&mut tables, "pathnames").unwrap();
    let bus = Bus::new();
    let mut rx = bus.get_receiver();

    let pipeline = EventPipeline::new(&config(1, ShutdownPolicy::Drain), resolver.clone(), bus)
        .with_revision_sink(Box::new(revisions.clone()));
    let mut sender = pipeline.sender();

    let syslog = PathKey::new(MOUNT, 5, 0);
    let auth = PathKey::new(MOUNT, 6, 0);
    // each CPU is ordered, the interleaving between them is not
    sender.send(on_cpu(0, record(1, OPEN, &[syslog])));
    sender.send(on_cpu(0, record(4, OPEN, &[auth])));
    sender.send(on_cpu(0, record(6, UNLINK, &[syslog])));
    sender.send(on_cpu(1, record(2, OPEN, &[auth])));
    sender.send(on_cpu(1, record(3, OPEN, &[syslog])));
    sender.send(on_cpu(1, record(5, OPEN, &[PathKey::new(MOUNT, 77, 0)])));

    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    let handle = tokio::spawn(pipeline.run(shutdown));

    let mut events = Vec::new();
    for _ in 0..6 {
        events.push(receive_from_broadcast(&mut rx, "test").await.unwrap());
    }
    tx_shutdown.send_signal();
    let report = handle.await.unwrap().unwrap();

    let timestamps: Vec<_> = events.iter().map(|event| event.timestamp).collect();
    assert_eq!(timestamps, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(events[0].path.as_deref(), Some("/var/log/syslog"));
    assert_eq!(events[1].path.as_deref(), Some("/var/log/auth.log"));
    assert_eq!(events[4].error, Some(ResolutionTag::NotFound));
    assert_eq!(events[5].kind, EventKind::Unlink);
    assert_eq!(events[5].discarder_revision, Some(1));

    // one table walk per distinct file plus the missing key, the repeated
    // opens are served from the cache
    assert_eq!(table.lookups(), 4 + 4 + 1);
    assert_eq!(revisions.get(MOUNT), Some(1));
    assert_eq!(report.delivered, 6);
    assert_eq!(report.discarded, 0);
    assert_eq!(report.reorderer.depth, 0);
    assert!(!resolver.is_started());
}

#[tokio::test]
async fn buffered_events_are_drained_on_shutdown() {
    let (mut tables, _, _) = tables();
    let resolver = Arc::new(DentryResolver::new(&ResolverConfig::default()));
    resolver.start(&mut tables, "pathnames").unwrap();
    let bus = Bus::new();
    let mut rx = bus.get_receiver();

    // retention large enough that no tick ever releases anything
    let pipeline = EventPipeline::new(&config(1_000_000, ShutdownPolicy::Drain), resolver, bus);
    let mut sender = pipeline.sender();
    for timestamp in (0..10).rev() {
        sender.send(on_cpu(
            timestamp % 2,
            record(timestamp, OPEN, &[PathKey::new(MOUNT, 5, 0)]),
        ));
    }

    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    let handle = tokio::spawn(pipeline.run(shutdown));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());

    tx_shutdown.send_signal();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.delivered, 10);

    let mut last = None;
    for _ in 0..10 {
        let event = rx.recv().await.unwrap();
        assert!(last.is_none_or(|last| last <= event.timestamp));
        last = Some(event.timestamp);
    }
}

#[tokio::test]
async fn buffered_events_can_be_discarded() {
    let (mut tables, _, _) = tables();
    let resolver = Arc::new(DentryResolver::new(&ResolverConfig::default()));
    resolver.start(&mut tables, "pathnames").unwrap();

    let pipeline =
        EventPipeline::new(&config(1_000_000, ShutdownPolicy::Discard), resolver, Bus::new());
    let mut sender = pipeline.sender();
    for timestamp in 0..4 {
        sender.send(on_cpu(0, record(timestamp, OPEN, &[])));
    }

    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    let handle = tokio::spawn(pipeline.run(shutdown));
    tx_shutdown.send_signal();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.discarded, 4);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.reorderer.discarded, 4);
}

#[tokio::test]
async fn resolver_must_be_started() {
    let resolver = Arc::new(DentryResolver::new(&ResolverConfig::default()));
    let pipeline = EventPipeline::new(&PipelineConfig::default(), resolver, Bus::new());
    let (_tx_shutdown, shutdown) = ShutdownSignal::new();
    assert!(matches!(
        pipeline.run(shutdown).await,
        Err(ResolverError::NotStarted)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn records_sent_across_shutdown_are_accounted() {
    const SENT: u64 = 200_000;

    let (mut tables, _, _) = tables();
    let resolver = Arc::new(DentryResolver::new(&ResolverConfig::default()));
    resolver.start(&mut tables, "pathnames").unwrap();
    let pipeline = EventPipeline::new(&config(1, ShutdownPolicy::Drain), resolver, Bus::new());

    let mut sender = pipeline.sender();
    let producer = std::thread::spawn(move || {
        for timestamp in 0..SENT {
            sender.send(on_cpu(
                timestamp % 2,
                record(timestamp, OPEN, &[PathKey::new(MOUNT, 5, 0)]),
            ));
        }
        sender
    });

    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    let handle = tokio::spawn(pipeline.run(shutdown));
    tokio::time::sleep(Duration::from_millis(5)).await;
    tx_shutdown.send_signal();
    let report = handle.await.unwrap().unwrap();

    let stats = producer.join().unwrap().stats();
    // everything accepted before the close was drained, the rest refused
    assert_eq!(stats.enqueued, report.delivered);
    assert_eq!(stats.depth, 0);
    assert_eq!(report.delivered + stats.discarded, SENT);
}
