//! Engine configuration with builder-style setters.

use std::path::PathBuf;

use crate::bloom::KeyHashFn;
use crate::errformat;
use crate::error::Result;
use crate::types::FieldType;

/// Table file versions this build reads and writes.
pub const SUPPORTED_VERSIONS: [u8; 2] = [1, 2];

/// Per-table options.
#[derive(Clone)]
pub struct TableOptions {
    /// Maximum number of records the table may hold.
    pub size: usize,
    /// Records per logical block; granularity of the sparse index and the
    /// block cache.
    pub block_size: usize,
    pub key_type: FieldType,
    pub value_type: FieldType,
    /// Table file format version to write.
    pub version: u8,
    /// Compression flag; only 0 (identity) is defined.
    pub compression: u8,
    /// Encoding flag; only 0 (identity) is defined.
    pub encoding: u8,
    /// Target bloom filter false-positive rate.
    pub bloom_error_rate: f64,
    /// Optional replacement for the bloom filter's default key hash.
    pub custom_hash: Option<KeyHashFn>,
}

impl TableOptions {
    pub fn new(key_type: FieldType, value_type: FieldType) -> Self {
        Self {
            size: 1024,
            block_size: 64,
            key_type,
            value_type,
            version: 1,
            compression: 0,
            encoding: 0,
            bloom_error_rate: 0.01,
            custom_hash: None,
        }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn bloom_error_rate(mut self, rate: f64) -> Self {
        self.bloom_error_rate = rate;
        self
    }

    pub fn custom_hash(mut self, hash: KeyHashFn) -> Self {
        self.custom_hash = Some(hash);
        self
    }

    /// Rejects option combinations no table can be built from.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return errformat!(
                "unsupported table version {}; supported: {SUPPORTED_VERSIONS:?}",
                self.version
            );
        }
        if self.compression != 0 {
            return errformat!(
                "unknown compression flag {}; only 0 (identity) is defined",
                self.compression
            );
        }
        if self.encoding != 0 {
            return errformat!(
                "unknown encoding flag {}; only 0 (identity) is defined",
                self.encoding
            );
        }
        if self.size == 0 || self.block_size == 0 {
            return errformat!("table size and block size must be positive");
        }
        Ok(())
    }
}

impl std::fmt::Debug for TableOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableOptions")
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .field("key_type", &self.key_type)
            .field("value_type", &self.value_type)
            .field("version", &self.version)
            .field("bloom_error_rate", &self.bloom_error_rate)
            .field("custom_hash", &self.custom_hash.is_some())
            .finish()
    }
}

/// Configuration for the full write/read pipeline.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Directory holding table files, sidecars, the WAL, and the lock file.
    pub dir: PathBuf,
    pub table: TableOptions,
    /// Number of memtable records that triggers a flush.
    pub memtable_threshold: usize,
    /// Bytes of WAL data staged between writes of the buffered appender.
    pub wal_buffer_size: usize,
}

impl TreeConfig {
    pub fn new(dir: impl Into<PathBuf>, key_type: FieldType, value_type: FieldType) -> Self {
        Self {
            dir: dir.into(),
            table: TableOptions::new(key_type, value_type),
            memtable_threshold: 1024,
            wal_buffer_size: 64 * 1024,
        }
    }

    pub fn table(mut self, table: TableOptions) -> Self {
        self.table = table;
        self
    }

    pub fn memtable_threshold(mut self, threshold: usize) -> Self {
        self.memtable_threshold = threshold.max(1);
        self
    }

    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = TableOptions::new(FieldType::U32, FieldType::U64);
        assert_eq!(opts.version, 1);
        assert_eq!(opts.compression, 0);
        assert_eq!(opts.encoding, 0);
        assert_eq!(opts.bloom_error_rate, 0.01);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TreeConfig::new("/tmp/db", FieldType::U32, FieldType::U32)
            .memtable_threshold(16)
            .wal_buffer_size(4096)
            .table(
                TableOptions::new(FieldType::U32, FieldType::U32)
                    .size(1000)
                    .block_size(100),
            );

        assert_eq!(config.memtable_threshold, 16);
        assert_eq!(config.wal_buffer_size, 4096);
        assert_eq!(config.table.size, 1000);
        assert_eq!(config.table.block_size, 100);
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let opts = TableOptions::new(FieldType::U32, FieldType::U32).version(9);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nonidentity_flags() {
        let mut opts = TableOptions::new(FieldType::U32, FieldType::U32);
        opts.compression = 1;
        assert!(opts.validate().is_err());

        let mut opts = TableOptions::new(FieldType::U32, FieldType::U32);
        opts.encoding = 3;
        assert!(opts.validate().is_err());
    }
}
