//! Coordinator event records: the append-only log file and the in-memory
//! list ordered by logical timestamp.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sorted_vec::SortedVec;
use thiserror::Error;

use crate::net::protocol::EventLogEntry;
use crate::simulation::signal::EventKind;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("event log {path}, line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One record as stored by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Coordinator logical time; absent for out-of-band records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    pub sim_time: f64,
    #[serde(default)]
    pub details: String,
}

impl LogRecord {
    pub fn from_entry(entry: &EventLogEntry, timestamp: Option<u64>) -> Self {
        Self {
            timestamp,
            kind: entry.kind,
            node: entry.node.clone(),
            vehicle_id: entry.vehicle_id.clone(),
            sim_time: entry.sim_time,
            details: entry.details.clone(),
        }
    }

    /// An out-of-band record carrying free text
    pub fn raw(node: &str, details: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            kind: EventKind::Raw,
            node: node.to_string(),
            vehicle_id: None,
            sim_time: 0.0,
            details: details.into(),
        }
    }

    pub fn entry(&self) -> EventLogEntry {
        EventLogEntry {
            kind: self.kind,
            sim_time: self.sim_time,
            node: self.node.clone(),
            vehicle_id: self.vehicle_id.clone(),
            details: self.details.clone(),
        }
    }
}

/// Newline-delimited JSON file that records are appended to
pub struct EventLogStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLogStore {
    /// Opens the log for appending, creating parent directories as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let path = path.as_ref().to_path_buf();
        let io_error = |source| EventLogError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &LogRecord) -> Result<(), EventLogError> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(file, "{}", line)
            .and_then(|_| file.flush())
            .map_err(|source| EventLogError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Every record in file order
    pub fn read_all(&self) -> Result<Vec<LogRecord>, EventLogError> {
        // Hold the append lock so a half-written line is never read
        let _guard = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = File::open(&self.path).map_err(|source| EventLogError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| EventLogError::Io {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| EventLogError::Parse {
                path: self.path.clone(),
                line: index + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Record with its position in the ordered list
#[derive(Debug, Clone)]
struct OrderedRecord {
    seq: u64,
    record: LogRecord,
}

impl OrderedRecord {
    fn key(&self) -> (bool, u64, u64) {
        (
            self.record.timestamp.is_none(),
            self.record.timestamp.unwrap_or(0),
            self.seq,
        )
    }
}

impl PartialEq for OrderedRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for OrderedRecord {}

impl PartialOrd for OrderedRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// In-memory records ordered by logical timestamp. Records without one
/// sort after all timestamped records, in insertion order.
pub struct EventList {
    records: Mutex<(u64, SortedVec<OrderedRecord>)>,
}

impl Default for EventList {
    fn default() -> Self {
        Self::new()
    }
}

impl EventList {
    pub fn new() -> Self {
        Self {
            records: Mutex::new((0, SortedVec::new())),
        }
    }

    pub fn add(&self, record: LogRecord) {
        let mut guard = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (next_seq, records) = &mut *guard;
        *next_seq += 1;
        records.insert(OrderedRecord {
            seq: *next_seq,
            record,
        });
    }

    pub fn add_raw(&self, details: impl Into<String>) {
        self.add(LogRecord::raw("SYSTEM", details));
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<LogRecord> {
        let guard = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.1.iter().map(|ordered| ordered.record.clone()).collect()
    }

    /// Writes the ordered snapshot as a pretty JSON array
    pub fn export(&self, path: impl AsRef<Path>) -> Result<(), EventLogError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| EventLogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| EventLogError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
