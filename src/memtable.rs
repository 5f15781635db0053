//! Double-buffered in-memory write buffer.
//!
//! Records accumulate in an ordered `primary` buffer until the configured
//! threshold is reached. At that point the buffer is locked for flushing
//! and new writes land in the `wait` buffer, so the write path never
//! stalls. [`Memtable::flush`] hands the outgoing buffer's records to the
//! caller in key order and atomically installs `wait` as the new `primary`.
//!
//! Buffers are `crossbeam_skiplist::SkipMap`s: they keep keys ordered, and
//! readers never block the writer. A key present in both buffers is read
//! from `primary` first: it was written before the lock and logically
//! precedes anything in `wait`.
//!
//! The memtable reports two events to its single subscriber (the pipeline):
//! `needs_flush` when the threshold is reached and `buffer_opened` after a
//! swap completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::record::DataNode;
use crate::types::Value;

/// Callbacks the memtable raises toward the pipeline. There is exactly one
/// subscriber, so this is a pair of slots rather than a pub/sub bus.
pub trait BufferEvents {
    /// The primary buffer reached the flush threshold and is now locked.
    fn needs_flush(&self) {}
    /// A flush swap completed; writes land in the new primary again.
    fn buffer_opened(&self) {}
}

/// Counters exposed by [`Memtable::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemtableStats {
    pub primary_records: usize,
    pub wait_records: usize,
    pub locked: bool,
}

pub struct Memtable {
    primary: Arc<SkipMap<Value, DataNode>>,
    wait: Arc<SkipMap<Value, DataNode>>,
    threshold: usize,
    locked: AtomicBool,
    observer: Option<Arc<dyn BufferEvents>>,
}

impl Memtable {
    pub fn new(threshold: usize) -> Self {
        Self {
            primary: Arc::new(SkipMap::new()),
            wait: Arc::new(SkipMap::new()),
            threshold: threshold.max(1),
            locked: AtomicBool::new(false),
            observer: None,
        }
    }

    /// Installs the pipeline's event subscriber.
    pub fn set_observer(&mut self, observer: Arc<dyn BufferEvents>) {
        self.observer = Some(observer);
    }

    /// Inserts or overwrites a record. While the primary buffer is locked
    /// for flushing the record lands in the wait buffer instead.
    pub fn insert(&self, node: DataNode) {
        let key = node.key().clone();
        if self.locked.load(Ordering::SeqCst) {
            self.wait.insert(key, node);
            return;
        }

        self.primary.insert(key, node);
        if self.primary.len() >= self.threshold && !self.locked.swap(true, Ordering::SeqCst) {
            if let Some(observer) = &self.observer {
                observer.needs_flush();
            }
        }
    }

    /// Reads a record, primary buffer first.
    pub fn get(&self, key: &Value) -> Option<DataNode> {
        self.primary
            .get(key)
            .or_else(|| self.wait.get(key))
            .map(|entry| entry.value().clone())
    }

    pub fn has(&self, key: &Value) -> bool {
        self.primary.contains_key(key) || self.wait.contains_key(key)
    }

    /// All buffered records in key order. Keys present in both buffers
    /// yield the primary record.
    pub fn peek_all(&self) -> Vec<(Value, DataNode)> {
        let mut merged = std::collections::BTreeMap::new();
        for entry in self.wait.iter() {
            merged.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in self.primary.iter() {
            merged.insert(entry.key().clone(), entry.value().clone());
        }
        merged.into_iter().collect()
    }

    /// Swaps the buffers and returns the outgoing primary's records in key
    /// order. Clears the lock and raises `buffer_opened`.
    pub fn flush(&mut self) -> Vec<DataNode> {
        let outgoing = std::mem::replace(&mut self.primary, Arc::clone(&self.wait));
        self.wait = Arc::new(SkipMap::new());
        self.locked.store(false, Ordering::SeqCst);

        if let Some(observer) = &self.observer {
            observer.buffer_opened();
        }
        outgoing
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drops everything in both buffers and unlocks.
    pub fn clear(&mut self) {
        self.primary = Arc::new(SkipMap::new());
        self.wait = Arc::new(SkipMap::new());
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.wait.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.wait.is_empty()
    }

    pub fn stats(&self) -> MemtableStats {
        MemtableStats {
            primary_records: self.primary.len(),
            wait_records: self.wait.len(),
            locked: self.is_locked(),
        }
    }
}
