//! The memtable ↔ table pipeline: the outer engine that wires the WAL,
//! the double-buffered memtable, and the table files together.
//!
//! # Write path
//!
//! ```text
//! insert/delete
//!       │
//!       ▼
//! ┌──────────┐     ┌───────────┐     threshold      ┌─────────────┐
//! │ WAL      │ ──► │ memtable  │ ─────────────────► │ new SSTable │
//! │ append   │     │ (primary) │   lock + swap      │ <id>.sst    │
//! └──────────┘     └───────────┘                    └─────────────┘
//! ```
//!
//! The WAL append is the commit point: a crash after the append but before
//! the memtable mutation is recovered by replay, so the operation is
//! effectively applied. After a flush lands in a table the WAL is rotated:
//! reset to its prefix and re-seeded with whatever the memtable still
//! holds.
//!
//! # Read path
//!
//! Memtable primary buffer, then wait buffer, then every table newest
//! first (bloom probe before any I/O). The first record found wins, so a
//! newer tombstone shadows older live records.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::TreeConfig;
use crate::error::Result;
use crate::flock::DirLock;
use crate::memtable::{BufferEvents, Memtable};
use crate::record::{DataNode, WalMethod};
use crate::sstable::SSTable;
use crate::types::Value;
use crate::wal::Wal;

const LOCK_FILE: &str = "shaledb.lock";
const WAL_FILE: &str = "shaledb.wal";

/// The pipeline's subscription to memtable events.
#[derive(Default)]
struct FlushSignal {
    raised: AtomicBool,
}

impl FlushSignal {
    fn take(&self) -> bool {
        self.raised.swap(false, Ordering::SeqCst)
    }
}

impl BufferEvents for FlushSignal {
    fn needs_flush(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }
}

pub struct Tree {
    config: TreeConfig,
    _lock: DirLock,
    wal: Wal,
    memtable: Memtable,
    /// Open tables, newest first.
    tables: Vec<SSTable>,
    next_table_id: u64,
    flush_signal: Arc<FlushSignal>,
}

impl Tree {
    /// Opens the engine: locks the directory, opens existing tables newest
    /// first, and replays a leftover WAL into the memtable.
    pub fn open(config: TreeConfig) -> Result<Self> {
        config.table.validate()?;
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| crate::error::Error::IO(format!("create {}: {e}", config.dir.display())))?;

        let lock = DirLock::lock(config.dir.join(LOCK_FILE))?;

        let mut table_files = Self::discover_tables(&config.dir)?;
        // Newest first: table ids increase monotonically.
        table_files.sort_by(|a, b| b.0.cmp(&a.0));
        let next_table_id = table_files.first().map_or(0, |(id, _)| id + 1);

        let mut tables = Vec::with_capacity(table_files.len());
        for (_, path) in &table_files {
            tables.push(SSTable::open(path, config.table.clone())?);
        }

        let flush_signal = Arc::new(FlushSignal::default());
        let mut memtable = Memtable::new(config.memtable_threshold);
        memtable.set_observer(flush_signal.clone());

        let mut wal = Wal::open(&config.dir.join(WAL_FILE), config.wal_buffer_size)?;
        let replayed = wal.replay(&memtable)?;
        if replayed > 0 {
            tracing::info!(replayed, "recovered memtable from WAL");
        }

        let mut tree = Self {
            config,
            _lock: lock,
            wal,
            memtable,
            tables,
            next_table_id,
            flush_signal,
        };
        // The replay may already have filled the memtable past the
        // threshold.
        if tree.flush_signal.take() {
            tree.flush()?;
        }
        Ok(tree)
    }

    /// Inserts or overwrites a key. The WAL append commits the operation;
    /// a threshold-triggered flush runs before returning.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<()> {
        let node = DataNode::new(
            key,
            value,
            self.config.table.key_type,
            self.config.table.value_type,
            now_ms(),
            false,
        )?;
        self.wal.append(&node, WalMethod::Append)?;
        self.memtable.insert(node);
        self.maybe_flush()
    }

    /// Deletes a key by writing a tombstone that shadows every earlier
    /// record for it.
    pub fn delete(&mut self, key: Value) -> Result<()> {
        let node = DataNode::tombstone(
            key,
            self.config.table.key_type,
            self.config.table.value_type,
            now_ms(),
        )?;
        self.wal.append(&node, WalMethod::Delete)?;
        self.memtable.insert(node);
        self.maybe_flush()
    }

    /// Point read: memtable buffers first, then tables newest first. A
    /// tombstone reports the key as absent.
    pub fn get(&mut self, key: &Value) -> Result<Option<Value>> {
        if let Some(node) = self.memtable.get(key) {
            return Ok(filter_tombstone(node));
        }
        for table in self.tables.iter_mut() {
            if !table.may_have(key) {
                continue;
            }
            if let Some(node) = table.read_key(key)? {
                return Ok(filter_tombstone(node));
            }
        }
        Ok(None)
    }

    /// True when a live (non-tombstone) record exists for `key`.
    pub fn contains(&mut self, key: &Value) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Flushes the memtable's primary buffer into a fresh table and
    /// rotates the WAL. Returns `false` when there was nothing to flush.
    pub fn flush(&mut self) -> Result<bool> {
        self.flush_signal.take();
        let records = self.memtable.flush();
        if records.is_empty() {
            return Ok(false);
        }

        let id = self.next_table_id;
        self.next_table_id += 1;
        let path = self.config.dir.join(format!("{id:08}.sst"));

        let mut table = SSTable::open(&path, self.config.table.clone())?;
        table.write(&records)?;
        tracing::info!(
            table = %path.display(),
            records = records.len(),
            "flushed memtable to table"
        );
        self.tables.insert(0, table);

        // Rotate the WAL: drop what the flush made durable and re-seed it
        // with anything that landed in the wait buffer meanwhile.
        self.wal.truncate()?;
        for (_, node) in self.memtable.peek_all() {
            let method = if node.deleted() {
                WalMethod::Delete
            } else {
                WalMethod::Append
            };
            self.wal.append(&node, method)?;
        }
        self.wal.flush()?;
        Ok(true)
    }

    /// Flushes WAL buffers to disk and fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.wal.sync()
    }

    /// Open tables, newest first. Mutable access because table reads go
    /// through per-table caches and file handles.
    pub fn tables_mut(&mut self) -> &mut Vec<SSTable> {
        &mut self.tables
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn memtable(&self) -> &Memtable {
        &self.memtable
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.config.dir
    }

    /// Syncs the WAL and releases the directory lock.
    pub fn close(mut self) -> Result<()> {
        self.wal.sync()
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.flush_signal.take() {
            self.flush()?;
        }
        Ok(())
    }

    fn discover_tables(dir: &std::path::Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| crate::error::Error::IO(format!("read_dir {}: {e}", dir.display())))?;
        for entry in entries {
            let path = entry
                .map_err(|e| crate::error::Error::IO(format!("read_dir {}: {e}", dir.display())))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("sst") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok());
            match id {
                Some(id) => found.push((id, path)),
                None => {
                    tracing::warn!(path = %path.display(), "ignoring table with non-numeric name")
                }
            }
        }
        Ok(found)
    }
}

fn filter_tombstone(node: DataNode) -> Option<Value> {
    if node.deleted() {
        None
    } else {
        Some(node.value().clone())
    }
}

/// Milliseconds since the epoch, clamped to at least 1 so every produced
/// record satisfies the positive-timestamp invariant.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |d| d.as_millis() as u64)
        .max(1)
}
