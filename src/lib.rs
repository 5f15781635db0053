//! ShaleDB: an embeddable, single-node, log-structured merge key–value
//! storage engine with strongly-typed keys and values.
//!
//! Writes go write-ahead log → double-buffered memtable → immutable sorted
//! table files; reads go memtable → per-table bloom filter → sparse index →
//! one bounded block read through an LFU cache → binary search inside the
//! block. See the module docs of [`tree`], [`sstable`], [`wal`], and
//! [`memtable`] for the details of each stage.

pub mod appender;
pub mod bitarray;
pub mod bloom;
pub mod cache;
pub mod config;
pub mod error;
pub mod flock;
pub mod memtable;
pub mod record;
pub mod rlock;
pub mod sorted;
pub mod sstable;
pub mod tree;
pub mod types;
pub mod wal;

#[cfg(test)]
pub mod tmpfs;

pub use bloom::BloomFilter;
pub use config::{TableOptions, TreeConfig};
pub use error::{Error, Result};
pub use memtable::{BufferEvents, Memtable};
pub use record::{DataNode, WalMethod};
pub use rlock::ReentrantMutex;
pub use sstable::SSTable;
pub use tree::Tree;
pub use types::{FieldType, Value};
pub use wal::Wal;
