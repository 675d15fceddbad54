//! Kernel record header and the resolved event handed to consumers.
//!
//! Every record starts with the same fixed header, host byte order:
//!
//! ```text
//! 0      8       12         16              32              48
//! | ts   | type  | reserved | primary key   | secondary key |
//! ```
//!
//! The secondary key is only present for renames. The rest of the record is
//! not interpreted here.

use std::fmt;

use bpf_common::{PathKey, pathnames::PATH_KEY_SIZE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::dentry::DentryError;

const TIMESTAMP_OFFSET: usize = 0;
const TYPE_OFFSET: usize = 8;
const PRIMARY_KEY_OFFSET: usize = 16;
const SECONDARY_KEY_OFFSET: usize = PRIMARY_KEY_OFFSET + PATH_KEY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Open,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Umount,
    Other,
}

impl EventKind {
    pub fn from_raw(value: u32) -> Self {
        match value {
            1 => EventKind::Open,
            2 => EventKind::Mkdir,
            3 => EventKind::Unlink,
            4 => EventKind::Rmdir,
            5 => EventKind::Rename,
            6 => EventKind::Umount,
            _ => EventKind::Other,
        }
    }

    /// Bytes of the record needed to decode the path keys of this kind.
    fn header_len(self) -> usize {
        match self {
            EventKind::Other => PRIMARY_KEY_OFFSET,
            EventKind::Rename => SECONDARY_KEY_OFFSET + PATH_KEY_SIZE,
            _ => SECONDARY_KEY_OFFSET,
        }
    }

    /// Kinds whose path names an entry that no longer exists afterwards.
    pub fn is_removal(self) -> bool {
        matches!(self, EventKind::Unlink | EventKind::Rmdir)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("record too short: {len} bytes, {needed} needed")]
    TooShort { len: usize, needed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u64,
    pub kind: EventKind,
    pub raw_type: u32,
    pub primary: Option<PathKey>,
    pub secondary: Option<PathKey>,
}

impl EventHeader {
    pub fn parse(data: &[u8]) -> Result<Self, HeaderError> {
        let too_short = |needed| HeaderError::TooShort {
            len: data.len(),
            needed,
        };
        let timestamp = read_u64(data, TIMESTAMP_OFFSET).ok_or_else(|| too_short(TYPE_OFFSET))?;
        let raw_type =
            read_u32(data, TYPE_OFFSET).ok_or_else(|| too_short(PRIMARY_KEY_OFFSET))?;
        let kind = EventKind::from_raw(raw_type);
        let needed = kind.header_len();
        if data.len() < needed {
            return Err(too_short(needed));
        }

        let key_at = |offset: usize| data.get(offset..).and_then(PathKey::read);
        let (primary, secondary) = match kind {
            EventKind::Other => (None, None),
            EventKind::Rename => (key_at(PRIMARY_KEY_OFFSET), key_at(SECONDARY_KEY_OFFSET)),
            _ => (key_at(PRIMARY_KEY_OFFSET), None),
        };
        Ok(Self {
            timestamp,
            kind,
            raw_type,
            primary,
            secondary,
        })
    }

    /// Best-effort timestamp of a record too short to be parsed.
    pub fn timestamp_of(data: &[u8]) -> u64 {
        read_u64(data, TIMESTAMP_OFFSET).unwrap_or_default()
    }
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

/// Why the path of an event is missing or not fully trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResolutionTag {
    NotFound,
    TruncatedSegment,
    TruncatedParents,
    InvalidKey,
    TableError,
    Malformed,
}

impl ResolutionTag {
    /// A degraded event still carries a partial path.
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            ResolutionTag::TruncatedSegment | ResolutionTag::TruncatedParents
        )
    }
}

impl From<&DentryError> for ResolutionTag {
    fn from(err: &DentryError) -> Self {
        match err {
            DentryError::NotFound { .. } => ResolutionTag::NotFound,
            DentryError::TruncatedSegment { .. } => ResolutionTag::TruncatedSegment,
            DentryError::TruncatedParents { .. } => ResolutionTag::TruncatedParents,
            DentryError::InvalidKey { .. } => ResolutionTag::InvalidKey,
            DentryError::TableLookup { .. } => ResolutionTag::TableError,
        }
    }
}

/// A kernel record after reordering and path resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEvent {
    pub cpu: u64,
    pub timestamp: u64,
    pub received: DateTime<Utc>,
    pub kind: EventKind,
    pub mount_id: u32,
    pub inode: u64,
    pub path: Option<String>,
    /// Target of a rename
    pub destination: Option<String>,
    /// Revision of the mount after a removal
    pub discarder_revision: Option<u32>,
    /// First resolution problem met, if any
    pub error: Option<ResolutionTag>,
}

impl ResolvedEvent {
    pub fn new(cpu: u64, timestamp: u64, kind: EventKind) -> Self {
        Self {
            cpu,
            timestamp,
            received: Utc::now(),
            kind,
            mount_id: 0,
            inode: 0,
            path: None,
            destination: None,
            discarder_revision: None,
            error: None,
        }
    }

    pub fn malformed(cpu: u64, data: &[u8]) -> Self {
        let mut event = Self::new(cpu, EventHeader::timestamp_of(data), EventKind::Other);
        event.error = Some(ResolutionTag::Malformed);
        event
    }

    /// Record a resolution problem, keeping the first one.
    pub fn tag(&mut self, tag: ResolutionTag) {
        self.error.get_or_insert(tag);
    }

    /// True when resolution failed outright, without even a partial path.
    pub fn is_unresolved(&self) -> bool {
        self.error.is_some_and(|tag| !tag.is_degraded())
    }
}

impl fmt::Display for ResolvedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.received.format("%Y-%m-%dT%TZ");
        let kind = &self.kind;
        let cpu = self.cpu;
        let path = self.path.as_deref().unwrap_or("?");

        if f.alternate() {
            write!(f, "[{time} \x1b[1;30;46mEVENT\x1b[0m cpu={cpu}] [{kind}] {path}")?;
        } else {
            write!(f, "[{time} EVENT cpu={cpu}] [{kind}] {path}")?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " -> {destination}")?;
        }
        if let Some(revision) = self.discarder_revision {
            write!(f, " revision={revision}")?;
        }
        match self.error {
            Some(tag) if f.alternate() => write!(f, " \x1b[1;30;43m{tag}\x1b[0m"),
            Some(tag) => write!(f, " ({tag})"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp: u64, kind: u32, keys: &[PathKey]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&timestamp.to_ne_bytes());
        data.extend_from_slice(&kind.to_ne_bytes());
        data.extend_from_slice(&[0; 4]);
        for key in keys {
            let mut buffer = [0; PATH_KEY_SIZE];
            key.write(&mut buffer);
            data.extend_from_slice(&buffer);
        }
        data
    }

    #[test]
    fn parse_open() {
        let key = PathKey::new(3, 42, 1);
        let header = EventHeader::parse(&record(7, 1, &[key])).unwrap();
        assert_eq!(header.timestamp, 7);
        assert_eq!(header.kind, EventKind::Open);
        assert_eq!(header.primary, Some(key));
        assert_eq!(header.secondary, None);
    }

    #[test]
    fn parse_rename() {
        let source = PathKey::new(3, 42, 1);
        let destination = PathKey::new(3, 43, 0);
        let header = EventHeader::parse(&record(9, 5, &[source, destination])).unwrap();
        assert_eq!(header.kind, EventKind::Rename);
        assert_eq!(header.primary, Some(source));
        assert_eq!(header.secondary, Some(destination));
    }

    #[test]
    fn short_records() {
        assert_eq!(
            EventHeader::parse(&[0; 4]),
            Err(HeaderError::TooShort { len: 4, needed: 8 })
        );
        assert_eq!(
            EventHeader::parse(&record(1, 2, &[])),
            Err(HeaderError::TooShort {
                len: 16,
                needed: 32
            })
        );
        let key = PathKey::new(1, 1, 0);
        assert_eq!(
            EventHeader::parse(&record(1, 5, &[key])),
            Err(HeaderError::TooShort {
                len: 32,
                needed: 48
            })
        );
        assert_eq!(EventHeader::timestamp_of(&record(11, 5, &[])), 11);
    }

    #[test]
    fn unknown_kinds_pass_through() {
        let header = EventHeader::parse(&record(1, 99, &[])).unwrap();
        assert_eq!(header.kind, EventKind::Other);
        assert_eq!(header.raw_type, 99);
        assert_eq!(header.primary, None);
    }

    #[test]
    fn tags() {
        let err = DentryError::TruncatedParents {
            path: "/a".to_string(),
        };
        let tag = ResolutionTag::from(&err);
        assert_eq!(tag, ResolutionTag::TruncatedParents);
        assert!(tag.is_degraded());
        assert_eq!(tag.to_string(), "truncated_parents");
        assert!(!ResolutionTag::Malformed.is_degraded());
        assert_eq!("umount".parse::<EventKind>().unwrap(), EventKind::Umount);
    }

    #[test]
    fn display_and_json() {
        let mut event = ResolvedEvent::new(2, 100, EventKind::Rename);
        event.path = Some("/tmp/a".to_string());
        event.destination = Some("/tmp/b".to_string());
        event.tag(ResolutionTag::TruncatedSegment);
        event.tag(ResolutionTag::NotFound);

        let text = event.to_string();
        assert!(text.contains("[rename] /tmp/a -> /tmp/b (truncated_segment)"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "rename");
        assert_eq!(json["error"], "truncated_segment");
        assert_eq!(json["destination"], "/tmp/b");
        assert!(!event.is_unresolved());
    }
}
