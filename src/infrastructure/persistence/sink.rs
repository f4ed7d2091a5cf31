//! Storage Sink Implementations
//!
//! Two [`StorageSink`] adapters: a JSONL spool for running against the local
//! filesystem, and an in-memory map used by tests. Both honor the
//! `(timestamp, symbol)` upsert contract so retried batches stay idempotent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::application::ports::{StorageError, StorageSink};
use crate::domain::message::TickRow;

type RowKey = (DateTime<Utc>, String);

// =============================================================================
// JSONL Spool Sink
// =============================================================================

/// How many recent `(timestamp, symbol)` keys the spool remembers for
/// deduplication. Retried batches arrive well within this window; older keys
/// are forgotten so memory stays flat over long uptimes.
const DEDUP_KEY_CAPACITY: usize = 8192;

#[derive(Debug)]
struct JsonlSinkInner {
    writer: BufWriter<File>,
    written_keys: HashSet<RowKey>,
    key_order: VecDeque<RowKey>,
    key_capacity: usize,
}

/// Appends rows to a local JSONL spool file, one row per line.
///
/// Rows whose `(timestamp, symbol)` key was recently written are skipped, so
/// a retried batch that partially succeeded does not spool the same row
/// twice. The dedup window is bounded to the most recent keys.
#[derive(Debug)]
pub struct JsonlSink {
    inner: parking_lot::Mutex<JsonlSinkInner>,
}

impl JsonlSink {
    /// Open (or create) the spool file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or the file cannot be
    /// created.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Self::open_with_capacity(path, DEDUP_KEY_CAPACITY)
    }

    fn open_with_capacity(path: &Path, key_capacity: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: parking_lot::Mutex::new(JsonlSinkInner {
                writer: BufWriter::new(file),
                written_keys: HashSet::new(),
                key_order: VecDeque::new(),
                key_capacity,
            }),
        })
    }
}

#[async_trait]
impl StorageSink for JsonlSink {
    async fn write_rows(&self, rows: &[TickRow]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();

        for row in rows {
            let key = (row.timestamp, row.symbol.clone());
            if inner.written_keys.contains(&key) {
                continue;
            }
            let line = serde_json::to_string(row)
                .map_err(|e| StorageError::Rejected(format!("unserializable row: {e}")))?;
            writeln!(inner.writer, "{line}")
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            inner.written_keys.insert(key.clone());
            inner.key_order.push_back(key);
            while inner.key_order.len() > inner.key_capacity {
                if let Some(oldest) = inner.key_order.pop_front() {
                    inner.written_keys.remove(&oldest);
                }
            }
        }

        inner
            .writer
            .flush()
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

// =============================================================================
// In-Memory Sink
// =============================================================================

/// In-memory upsert store keyed by `(timestamp, symbol)`.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: parking_lot::Mutex<HashMap<RowKey, TickRow>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct rows stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether the sink is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// All stored rows, ordered by `(timestamp, symbol)`.
    #[must_use]
    pub fn rows(&self) -> Vec<TickRow> {
        let mut rows: Vec<TickRow> = self.rows.lock().values().cloned().collect();
        rows.sort_by(|a, b| (a.timestamp, &a.symbol).cmp(&(b.timestamp, &b.symbol)));
        rows
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn write_rows(&self, rows: &[TickRow]) -> Result<(), StorageError> {
        let mut stored = self.rows.lock();
        for row in rows {
            stored.insert((row.timestamp, row.symbol.clone()), row.clone());
        }
        Ok(())
    }
}
