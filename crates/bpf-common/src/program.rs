//! [`Program`] is a wrapper around [`aya::Ebpf`] which:
//! - loads the instrumentation object and attaches its programs
//! - runs one background task per CPU reading raw records from a perf array
//! - hands out the kernel tables used to resolve paths.
//!
use core::fmt;
use std::{collections::HashSet, fmt::Display, io, path::PathBuf, str::FromStr};

use aya::{
    Btf, BtfError, Ebpf, EbpfLoader,
    maps::{
        Array, HashMap, Map, MapError,
        perf::{AsyncPerfEventArray, PerfBufferError},
    },
    programs::{KProbe, Lsm, RawTracePoint, TracePoint},
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
};

use crate::{
    BpfSender,
    pathnames::{KernelPathTable, KernelRevisionMap, PathTable, RevisionSink, TableProvider},
};

const PERF_HEADER_SIZE: usize = 4;

pub const PERF_PAGES_DEFAULT: usize = 64;

/// Max record size in bytes
const BUFFER_MAX: usize = 16384;

/// Every record starts with the producer timestamp.
const RECORD_TIMESTAMP_SIZE: usize = 8;

/// Number of records read from a perf buffer in one go.
const READ_BATCH: usize = 10;

/// BpfContext contains extra settings which could be provided on program load
#[derive(Clone, Debug)]
pub struct BpfContext {
    /// Directory where maps are pinned. When missing, maps live as long as
    /// the program.
    pin_path: Option<PathBuf>,
    /// How many pages of memory (4Kb) to use for perf arrays.
    /// NOTE: this will result in a memory usage of:
    /// (number of cores) * (perf_pages) * 4Kb
    perf_pages: usize,
    /// Log level for eBPF print statements
    log_level: BpfLogLevel,
}

#[derive(Clone, Copy, Debug)]
pub enum BpfLogLevel {
    Disabled = 0,
    Error = 1,
    Debug = 2,
}

impl BpfContext {
    pub fn new(pin_path: Option<PathBuf>, mut perf_pages: usize, log_level: BpfLogLevel) -> Self {
        if perf_pages == 0 || (perf_pages & (perf_pages - 1) != 0) {
            log::warn!("Invalid value ({perf_pages}) for perf_pages, which must be a power of 2.");
            log::warn!("The default value {PERF_PAGES_DEFAULT} will be used.");
            perf_pages = PERF_PAGES_DEFAULT;
        }
        Self {
            pin_path,
            perf_pages,
            log_level,
        }
    }

    pub fn perf_pages(&self) -> usize {
        self.perf_pages
    }
}

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("loading probe")]
    LoadingProbe(#[from] aya::EbpfError),
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramTypeError(String),
    #[error("invalid program specification {0:?}, expected <kind>:<name>")]
    InvalidProgramSpec(String),
    #[error("failed program load {program}")]
    ProgramLoadError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed program attach {program}")]
    ProgramAttachError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error(transparent)]
    MapError(#[from] MapError),
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("map already used {0}")]
    MapAlreadyUsed(String),
    #[error("perf buffer error {0}")]
    PerfBuffer(#[from] PerfBufferError),
    #[error("loading BTF {0}")]
    BtfError(#[from] BtfError),
    #[error("reading online cpus")]
    OnlineCpus(#[source] io::Error),
    #[error("running background aya task {0}")]
    JoinError(#[from] JoinError),
}

pub struct ProgramBuilder {
    /// probe name, used for logging purposes
    name: &'static str,
    /// Probe configuration
    ctx: BpfContext,
    probe: Vec<u8>,
    programs: Vec<ProgramSpec>,
}

impl ProgramBuilder {
    pub fn new(ctx: BpfContext, name: &'static str, probe: Vec<u8>) -> Self {
        Self {
            ctx,
            name,
            probe,
            programs: Vec::new(),
        }
    }

    pub fn program(mut self, spec: ProgramSpec) -> Self {
        self.programs.push(spec);
        self
    }

    pub async fn start(self) -> Result<Program, ProgramError> {
        // Background reader tasks are notified of our exit through this
        // channel: dropping the sender makes every `changed()` fail.
        let (tx_exit, _) = watch::channel(());
        let ctx = self.ctx.clone();
        let name = self.name.to_string();
        let ProgramBuilder {
            ctx: load_ctx,
            probe,
            programs,
            ..
        } = self;

        let bpf = tokio::task::spawn_blocking(move || {
            let log_level = load_ctx.log_level as i32;
            let btf = programs
                .iter()
                .any(|program| matches!(program, ProgramSpec::Lsm(_)))
                .then(Btf::from_sys_fs)
                .transpose()?;
            let mut loader = EbpfLoader::new();
            if let Some(pin_path) = &load_ctx.pin_path {
                let _ = std::fs::create_dir_all(pin_path);
                loader.map_pin_path(pin_path);
            }
            loader.set_global("log_level", &log_level, false);
            let mut bpf = loader.load(&probe)?;
            for program in &programs {
                program.attach(&mut bpf, btf.as_ref())?;
                log::debug!("attached {program}");
            }
            Result::<Ebpf, ProgramError>::Ok(bpf)
        })
        .await??;

        Ok(Program {
            tx_exit,
            name,
            ctx,
            bpf,
            used_maps: Default::default(),
            readers: Vec::new(),
        })
    }
}

/// A program of the instrumentation object and where to attach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSpec {
    TracePoint(String, String),
    RawTracePoint(String),
    Kprobe(String),
    Kretprobe(String),
    Lsm(String),
}

impl Display for ProgramSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramSpec::TracePoint(section, tracepoint) => {
                write!(f, "tracepoint {section}/{tracepoint}")
            }
            ProgramSpec::RawTracePoint(tracepoint) => write!(f, "raw_tracepoint {tracepoint}"),
            ProgramSpec::Kprobe(kprobe) => write!(f, "kprobe {kprobe}"),
            ProgramSpec::Kretprobe(kretprobe) => write!(f, "kretprobe {kretprobe}"),
            ProgramSpec::Lsm(lsm) => write!(f, "lsm {lsm}"),
        }
    }
}

/// Parses `<kind>:<name>`, for example `kprobe:security_inode_rmdir` or
/// `tracepoint:syscalls/sys_enter_unlinkat`.
impl FromStr for ProgramSpec {
    type Err = ProgramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProgramError::InvalidProgramSpec(s.to_string());
        let (kind, name) = s.split_once(':').ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }
        match kind {
            "kprobe" => Ok(ProgramSpec::Kprobe(name.to_string())),
            "kretprobe" => Ok(ProgramSpec::Kretprobe(name.to_string())),
            "raw_tracepoint" => Ok(ProgramSpec::RawTracePoint(name.to_string())),
            "lsm" => Ok(ProgramSpec::Lsm(name.to_string())),
            "tracepoint" => match name.split_once('/') {
                Some((section, tracepoint)) if !section.is_empty() && !tracepoint.is_empty() => {
                    Ok(ProgramSpec::TracePoint(
                        section.to_string(),
                        tracepoint.to_string(),
                    ))
                }
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

impl ProgramSpec {
    fn attach(&self, bpf: &mut Ebpf, btf: Option<&Btf>) -> Result<(), ProgramError> {
        let load_err = |program_error| ProgramError::ProgramLoadError {
            program: self.to_string(),
            program_error: Box::new(program_error),
        };
        let attach_err = |program_error| ProgramError::ProgramAttachError {
            program: self.to_string(),
            program_error: Box::new(program_error),
        };
        match self {
            ProgramSpec::TracePoint(section, tracepoint) => {
                let program: &mut TracePoint = extract_program(bpf, tracepoint)?;
                program.load().map_err(load_err)?;
                program.attach(section, tracepoint).map_err(attach_err)?;
            }
            ProgramSpec::RawTracePoint(tracepoint) => {
                let program: &mut RawTracePoint = extract_program(bpf, tracepoint)?;
                program.load().map_err(load_err)?;
                program.attach(tracepoint).map_err(attach_err)?;
            }
            ProgramSpec::Kretprobe(kprobe) | ProgramSpec::Kprobe(kprobe) => {
                let program: &mut KProbe = extract_program(bpf, kprobe)?;
                program.load().map_err(load_err)?;
                program.attach(kprobe, 0).map_err(attach_err)?;
            }
            ProgramSpec::Lsm(lsm) => {
                let btf = match btf {
                    Some(btf) => btf,
                    None => return Err(ProgramError::ProgramTypeError(lsm.to_string())),
                };
                let program: &mut Lsm = extract_program(bpf, lsm)?;
                program.load(lsm, btf).map_err(load_err)?;
                program.attach().map_err(attach_err)?;
            }
        }
        Ok(())
    }
}

fn extract_program<'a, T>(bpf: &'a mut Ebpf, program: &str) -> Result<&'a mut T, ProgramError>
where
    T: 'a,
    &'a mut T: TryFrom<&'a mut aya::programs::Program>,
{
    bpf.program_mut(program)
        .ok_or_else(|| ProgramError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| ProgramError::ProgramTypeError(program.to_string()))
}

pub struct Program {
    /// Signal from the background thread to the background async tasks that
    /// we're exiting.
    tx_exit: watch::Sender<()>,
    ctx: BpfContext,
    name: String,
    bpf: Ebpf,
    used_maps: HashSet<String>,
    /// Per-CPU tasks spawned by `read_events`
    readers: Vec<JoinHandle<()>>,
}

impl Program {
    /// Watch a BPF_MAP_TYPE_PERF_EVENT_ARRAY and forward all its records to `sender`.
    /// A different task is run for each CPU.
    pub async fn read_events(
        &mut self,
        map_name: &str,
        sender: impl BpfSender,
    ) -> Result<(), ProgramError> {
        let map_resource = self.take_map(map_name)?;

        let mut perf_array = AsyncPerfEventArray::try_from(map_resource)?;
        let cpus = online_cpus().map_err(|(_, err)| ProgramError::OnlineCpus(err))?;

        let buffers = cpus
            .into_iter()
            .map(|cpu_id| {
                perf_array
                    .open(cpu_id, Some(self.ctx.perf_pages))
                    .map(|buf| (cpu_id, buf))
            })
            .collect::<Result<Vec<_>, PerfBufferError>>()?;
        for (cpu_id, mut buf) in buffers {
            let name = self.name.clone();
            let mut sender = sender.clone();
            let mut rx_exit = self.tx_exit.subscribe();
            let reader = tokio::spawn(async move {
                let mut buffers = (0..READ_BATCH)
                    .map(|_| BytesMut::with_capacity(PERF_HEADER_SIZE + BUFFER_MAX))
                    .collect::<Vec<_>>();
                loop {
                    let events = tokio::select! {
                        Err(_) = rx_exit.changed() => return,
                        events = buf.read_events(&mut buffers) => events,
                    };
                    match events {
                        Ok(events) => {
                            if events.lost > 0 {
                                log::warn!(
                                    "{}: Lost {} events on cpu {} (read {})",
                                    name,
                                    events.lost,
                                    cpu_id,
                                    events.read
                                );
                            }
                            for buffer in buffers.iter_mut().take(events.read) {
                                // split leaves the allocation behind, it is
                                // reclaimed on the next read once the consumer
                                // dropped its copy
                                let record = buffer.split().freeze();
                                match frame_record(cpu_id, record) {
                                    Some(event) => sender.send(Ok(event)),
                                    None => log::warn!("{name}: short record on cpu {cpu_id}"),
                                }
                            }
                        }
                        Err(e) => return sender.send(Err(e.into())),
                    };
                }
            });
            self.readers.push(reader);
        }

        // Signal the instrumentation we're ready by setting STATUS_INITIALIZED,
        // when it waits for it
        if let Some(map) = self.bpf.take_map("init_map") {
            let mut init_map: Array<_, u32> = Array::try_from(map)?;
            if let Err(err) = init_map.set(0, 1_u32, 0) {
                log::warn!(
                    "Error setting STATUS_INITIALIZED for {}: {:?}",
                    self.name,
                    err
                );
            }
        }
        Ok(())
    }

    /// Stop every reader task and wait for them to exit. Once this returns
    /// no sender given to [`Program::read_events`] is used anymore.
    pub async fn stop(self) {
        let Program {
            tx_exit,
            name,
            readers,
            ..
        } = self;
        drop(tx_exit);
        for reader in readers {
            if let Err(err) = reader.await {
                crate::log_error(&format!("{name}: reader task failed"), err);
            }
        }
        log::debug!("{name}: readers stopped");
    }

    fn take_map(&mut self, map_name: &str) -> Result<Map, ProgramError> {
        if self.used_maps.contains(map_name) {
            return Err(ProgramError::MapAlreadyUsed(map_name.to_string()));
        };

        let map_resource = self
            .bpf
            .take_map(map_name)
            .ok_or_else(|| ProgramError::MapNotFound(map_name.to_string()))?;

        self.used_maps.insert(map_name.to_string());
        Ok(map_resource)
    }
}

impl TableProvider for Program {
    fn path_table(&mut self, name: &str) -> Result<Box<dyn PathTable>, ProgramError> {
        let map = HashMap::try_from(self.take_map(name)?)?;
        Ok(Box::new(KernelPathTable::new(map)))
    }

    fn revision_map(&mut self, name: &str) -> Result<Box<dyn RevisionSink>, ProgramError> {
        let map = HashMap::try_from(self.take_map(name)?)?;
        Ok(Box::new(KernelRevisionMap::new(map)))
    }
}

/// One record read from a per-CPU buffer. The payload is opaque at this
/// level, only the leading timestamp is decoded.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub cpu: u64,
    pub timestamp: u64,
    pub buffer: Bytes,
}

fn frame_record(cpu_id: u32, record: Bytes) -> Option<RawEvent> {
    let timestamp = record.get(..RECORD_TIMESTAMP_SIZE)?;
    let mut raw = [0; RECORD_TIMESTAMP_SIZE];
    raw.copy_from_slice(timestamp);
    Some(RawEvent {
        cpu: cpu_id as u64,
        timestamp: u64::from_ne_bytes(raw),
        buffer: record,
    })
}

impl fmt::Display for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} ts={} len={}",
            self.cpu,
            self.timestamp,
            self.buffer.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_program_specs() {
        assert_eq!(
            "kprobe:security_inode_rmdir".parse::<ProgramSpec>().unwrap(),
            ProgramSpec::Kprobe("security_inode_rmdir".to_string())
        );
        assert_eq!(
            "tracepoint:syscalls/sys_enter_unlinkat"
                .parse::<ProgramSpec>()
                .unwrap(),
            ProgramSpec::TracePoint("syscalls".to_string(), "sys_enter_unlinkat".to_string())
        );
        assert_eq!(
            "lsm:path_rename".parse::<ProgramSpec>().unwrap(),
            ProgramSpec::Lsm("path_rename".to_string())
        );
        for invalid in ["kprobe", "kprobe:", "uprobe:foo", "tracepoint:sys_enter"] {
            assert!(
                matches!(
                    invalid.parse::<ProgramSpec>(),
                    Err(ProgramError::InvalidProgramSpec(_))
                ),
                "{invalid} should be rejected"
            );
        }
    }

    #[test]
    fn records_are_framed_with_their_timestamp() {
        let mut record = 42_u64.to_ne_bytes().to_vec();
        record.extend_from_slice(b"payload");
        let event = frame_record(3, Bytes::from(record)).unwrap();
        assert_eq!(event.cpu, 3);
        assert_eq!(event.timestamp, 42);
        assert_eq!(&event.buffer[8..], b"payload");

        assert!(frame_record(0, Bytes::from_static(b"short")).is_none());
    }

    #[test]
    fn perf_pages_must_be_a_power_of_two() {
        let ctx = BpfContext::new(None, 100, BpfLogLevel::Disabled);
        assert_eq!(ctx.perf_pages(), PERF_PAGES_DEFAULT);
        let ctx = BpfContext::new(None, 256, BpfLogLevel::Disabled);
        assert_eq!(ctx.perf_pages(), 256);
    }
}
