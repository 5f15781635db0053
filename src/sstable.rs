//! Immutable-after-flush table files and their sidecars.
//!
//! # File layout
//!
//! ```text
//! +--------------------------------------------------+
//! | 05 | "SSTT" | version | meta_len | metadata | 0A |   header + metadata
//! +--------------------------------------------------+
//! | record 0                                         |
//! +--------------------------------------------------+
//! | record 1                                         |
//! +--------------------------------------------------+
//! | ...                                              |
//! +--------------------------------------------------+
//! ```
//!
//! Version 1 metadata is 3 bytes (value tag, key tag, record width as one
//! byte), putting the first record at offset 11. Version 2 widens the
//! record width to a u16 LE (metadata length 4, records from offset 12) for
//! type pairs whose packed record exceeds 255 bytes. Records are packed at
//! a fixed stride in ascending key order; the layout of one record is
//! defined in [`crate::record`].
//!
//! Each table owns three files that are created, opened, and deleted
//! together: the data file, `<stem>.idx` (sparse index, one entry per
//! `block_size` records), and `<stem>.bloom` (raw bloom filter bits).
//!
//! # Read path
//!
//! A point read probes the bloom filter, asks the sparse index for the
//! greatest indexed key at or below the target, reads that block (at most
//! `block_size * record_width` bytes) through the LFU block cache, and
//! binary-searches the block at the record stride.
//!
//! The table does not serialize its own operations; the pipeline guarantees
//! that writes and reads on one table do not interleave.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bloom::BloomFilter;
use crate::cache::BlockCache;
use crate::config::{TableOptions, SUPPORTED_VERSIONS};
use crate::error::Result;
use crate::record::{record_width, DataNode};
use crate::sorted::SortedArray;
use crate::types::Value;
use crate::{errformat, errinvariant, errtype};

const TABLE_MAGIC: [u8; 4] = [0x53, 0x53, 0x54, 0x54]; // "SSTT"
const HEADER_LEN: u8 = 5;
const FILLER: u8 = 0x0A;
const V1_METADATA_LEN: u8 = 3;
const V2_METADATA_LEN: u8 = 4;

/// Blocks cached per table.
const CACHE_BLOCKS: usize = 64;

pub struct SSTable {
    path: PathBuf,
    index_path: PathBuf,
    bloom_path: PathBuf,
    file: File,
    options: TableOptions,
    /// On-disk format version; may differ from `options.version` when an
    /// existing file is opened.
    version: u8,
    data_start: u64,
    record_width: usize,
    len: usize,
    min_key: Option<Value>,
    max_key: Option<Value>,
    index: SortedArray,
    bloom: BloomFilter,
    cache: BlockCache,
}

impl SSTable {
    /// Opens a table, initializing a fresh file or validating an existing
    /// one, and reconstructs the sparse index and bloom filter from their
    /// sidecars.
    pub fn open(path: &Path, options: TableOptions) -> Result<Self> {
        options.validate()?;

        let width = record_width(&options.key_type, &options.value_type);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| crate::error::Error::IO(format!("open {}: {e}", path.display())))?;
        let file_size = file.metadata()?.len();

        let bloom = BloomFilter::new(
            options.size,
            options.bloom_error_rate,
            options.custom_hash.clone(),
        );
        let mut table = Self {
            index_path: path.with_extension("idx"),
            bloom_path: path.with_extension("bloom"),
            path: path.to_path_buf(),
            file,
            version: options.version,
            data_start: 0,
            record_width: width,
            len: 0,
            min_key: None,
            max_key: None,
            index: SortedArray::new(),
            bloom,
            cache: BlockCache::new(CACHE_BLOCKS),
            options,
        };

        if file_size == 0 {
            table.init_header()?;
        } else {
            table.validate_header(file_size)?;
            table.load_bounds()?;
            table.load_sidecars()?;
        }
        Ok(table)
    }

    /// Writes the header and metadata of a fresh table file.
    fn init_header(&mut self) -> Result<()> {
        if self.version == 1 && self.record_width > u8::MAX as usize {
            return errformat!(
                "record width {} does not fit the version-1 single-byte field; \
                 use version 2",
                self.record_width
            );
        }

        let mut header = Vec::with_capacity(12);
        header.push(HEADER_LEN);
        header.extend_from_slice(&TABLE_MAGIC);
        header.push(self.version);
        match self.version {
            1 => {
                header.push(V1_METADATA_LEN);
                header.push(self.options.value_type.tag());
                header.push(self.options.key_type.tag());
                header.push(self.record_width as u8);
            }
            _ => {
                header.push(V2_METADATA_LEN);
                header.push(self.options.value_type.tag());
                header.push(self.options.key_type.tag());
                header.write_u16::<LittleEndian>(self.record_width as u16)?;
            }
        }
        header.push(FILLER);

        self.data_start = header.len() as u64;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.flush()?;
        Ok(())
    }

    /// Validates the header of an existing file against the options.
    fn validate_header(&mut self, file_size: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut fixed = [0u8; 7];
        self.file.read_exact(&mut fixed).map_err(|e| {
            crate::error::Error::Format(format!("{}: header unreadable: {e}", self.path.display()))
        })?;

        if fixed[0] != HEADER_LEN {
            return errformat!(
                "{}: header length byte is {}, expected {HEADER_LEN}",
                self.path.display(),
                fixed[0]
            );
        }
        if fixed[1..5] != TABLE_MAGIC {
            return errformat!(
                "{}: bad magic {:02X?}, expected {TABLE_MAGIC:02X?}",
                self.path.display(),
                &fixed[1..5]
            );
        }
        let version = fixed[5];
        if !SUPPORTED_VERSIONS.contains(&version) {
            return errformat!(
                "{}: unsupported version {version}; supported: {SUPPORTED_VERSIONS:?}",
                self.path.display()
            );
        }
        let metadata_len = fixed[6];
        let expected_meta = if version == 1 {
            V1_METADATA_LEN
        } else {
            V2_METADATA_LEN
        };
        if metadata_len != expected_meta {
            return errformat!(
                "{}: metadata length {metadata_len} does not match version {version} \
                 (expected {expected_meta})",
                self.path.display()
            );
        }

        let mut meta = vec![0u8; metadata_len as usize + 1];
        self.file.read_exact(&mut meta)?;
        let value_tag = meta[0];
        let key_tag = meta[1];
        let stored_width = if version == 1 {
            meta[2] as usize
        } else {
            (&meta[2..4]).read_u16::<LittleEndian>()? as usize
        };
        let filler = meta[metadata_len as usize];

        if value_tag != self.options.value_type.tag() {
            return errtype!(
                "{}: value type tag 0x{value_tag:02X} does not match declared {} \
                 (0x{:02X})",
                self.path.display(),
                self.options.value_type,
                self.options.value_type.tag()
            );
        }
        if key_tag != self.options.key_type.tag() {
            return errtype!(
                "{}: key type tag 0x{key_tag:02X} does not match declared {} (0x{:02X})",
                self.path.display(),
                self.options.key_type,
                self.options.key_type.tag()
            );
        }
        if stored_width != self.record_width {
            return errformat!(
                "{}: stored record width {stored_width} does not match computed {}",
                self.path.display(),
                self.record_width
            );
        }
        if filler != FILLER {
            return errformat!(
                "{}: bad filler byte 0x{filler:02X}",
                self.path.display()
            );
        }

        self.version = version;
        self.data_start = 7 + metadata_len as u64 + 1;

        let data_bytes = file_size - self.data_start;
        if data_bytes % self.record_width as u64 != 0 {
            return errformat!(
                "{}: data region of {data_bytes} bytes is not a multiple of the \
                 {}-byte record",
                self.path.display(),
                self.record_width
            );
        }
        self.len = (data_bytes / self.record_width as u64) as usize;
        Ok(())
    }

    /// Decodes the first and last records to establish the key bounds.
    fn load_bounds(&mut self) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        let first = self.read_record_at(0)?;
        let last = self.read_record_at(self.len - 1)?;
        self.min_key = Some(first.key().clone());
        self.max_key = Some(last.key().clone());
        Ok(())
    }

    /// Loads the `.idx` and `.bloom` sidecars, rebuilding both from the
    /// data file when they are missing or empty.
    fn load_sidecars(&mut self) -> Result<()> {
        let index_bytes = match std::fs::read(&self.index_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(crate::error::Error::IO(format!(
                    "read {}: {e}",
                    self.index_path.display()
                )))
            }
        };
        let bloom_bytes = match std::fs::read(&self.bloom_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(crate::error::Error::IO(format!(
                    "read {}: {e}",
                    self.bloom_path.display()
                )))
            }
        };

        if index_bytes.is_empty() || bloom_bytes.is_empty() {
            if self.len > 0 {
                tracing::warn!(
                    path = %self.path.display(),
                    records = self.len,
                    "sidecars missing or empty; rebuilding from data file"
                );
                self.rebuild_sidecars()?;
                self.persist_sidecars()?;
            }
            return Ok(());
        }

        self.index = SortedArray::deserialize(&index_bytes, &self.options.key_type)?;
        self.verify_index()?;
        self.bloom.load_bits(bloom_bytes);
        Ok(())
    }

    /// Checks every index offset against the data region.
    fn verify_index(&self) -> Result<()> {
        let end = self.data_start + (self.len * self.record_width) as u64;
        for (key, offset) in self.index.iter() {
            if offset < self.data_start || offset >= end {
                return errinvariant!(
                    "{}: index offset {offset} for key {key} lies outside the data \
                     region [{}, {end})",
                    self.index_path.display(),
                    self.data_start
                );
            }
            if (offset - self.data_start) % self.record_width as u64 != 0 {
                return errinvariant!(
                    "{}: index offset {offset} for key {key} is not aligned to the \
                     {}-byte record stride",
                    self.index_path.display(),
                    self.record_width
                );
            }
        }
        Ok(())
    }

    /// Replaces the table contents with `records`, which must be in
    /// ascending key order. Rebuilds the index and bloom filter from
    /// scratch and drops every cached block.
    pub fn write(&mut self, records: &[DataNode]) -> Result<()> {
        if records.len() > self.options.size {
            return Err(crate::error::Error::Capacity {
                declared: self.options.size,
                requested: records.len(),
            });
        }
        self.check_ascending(records, None)?;

        let mut buf = Vec::with_capacity(records.len() * self.record_width);
        for node in records {
            buf.extend_from_slice(&node.encode_record()?);
        }

        self.file.set_len(self.data_start)?;
        self.file.seek(SeekFrom::Start(self.data_start))?;
        self.file.write_all(&buf)?;
        self.file.flush()?;

        self.len = records.len();
        self.min_key = records.first().map(|n| n.key().clone());
        self.max_key = records.last().map(|n| n.key().clone());

        self.index.clear();
        self.bloom.clear();
        for (i, node) in records.iter().enumerate() {
            self.account_record(i, node);
        }
        self.cache.clear();
        self.persist_sidecars()?;

        tracing::debug!(
            path = %self.path.display(),
            records = self.len,
            "table written"
        );
        Ok(())
    }

    /// Extends the table with `records` (ascending, and at or above the
    /// current max key). Index and bloom entries are appended; bounds move
    /// monotonically.
    pub fn append(&mut self, records: &[DataNode]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if self.len + records.len() > self.options.size {
            return Err(crate::error::Error::Capacity {
                declared: self.options.size,
                requested: self.len + records.len(),
            });
        }
        self.check_ascending(records, self.max_key.as_ref())?;

        let mut buf = Vec::with_capacity(records.len() * self.record_width);
        for node in records {
            buf.extend_from_slice(&node.encode_record()?);
        }

        let end = self.data_start + (self.len * self.record_width) as u64;
        self.file.seek(SeekFrom::Start(end))?;
        self.file.write_all(&buf)?;
        self.file.flush()?;

        for (j, node) in records.iter().enumerate() {
            self.account_record(self.len + j, node);
        }
        if self.min_key.is_none() {
            self.min_key = records.first().map(|n| n.key().clone());
        }
        self.max_key = records.last().map(|n| n.key().clone());
        self.len += records.len();

        // The previously last block may have been partially filled; cached
        // copies of it are stale now.
        self.cache.clear();
        self.persist_sidecars()?;
        Ok(())
    }

    /// Point read through bloom filter, sparse index, and block cache.
    pub fn read_key(&mut self, key: &Value) -> Result<Option<DataNode>> {
        if self.len == 0 || !self.bloom.lookup(key) {
            return Ok(None);
        }
        let block_offset = match self.index.greatest_le(key) {
            Some((_, offset)) => offset,
            None => return Ok(None),
        };

        let block = self.read_block(block_offset)?;
        let records = block.len() / self.record_width;

        // Binary search over the record stride inside the block.
        let mut low = 0usize;
        let mut high = records;
        while low < high {
            let mid = (low + high) / 2;
            let start = mid * self.record_width;
            let key_bytes = &block[start + 12..start + 12 + self.options.key_type.width()];
            let mid_key = self.options.key_type.decode(key_bytes)?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => {
                    let record = &block[start..start + self.record_width];
                    let offset = block_offset as i64 + start as i64;
                    let node = DataNode::decode_record(
                        record,
                        self.options.key_type,
                        self.options.value_type,
                        offset,
                    )?;
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }

    /// Reads the first `count` records in key order, without consulting the
    /// index.
    pub fn read_first_n(&mut self, count: usize) -> Result<Vec<DataNode>> {
        let count = count.min(self.len);
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            records.push(self.read_record_at(i)?);
        }
        Ok(records)
    }

    /// Reads every record in key order.
    pub fn read_all(&mut self) -> Result<Vec<DataNode>> {
        self.read_first_n(self.len)
    }

    /// Bloom-only existence probe; false means definitely absent.
    pub fn may_have(&self, key: &Value) -> bool {
        self.len > 0 && self.bloom.lookup(key)
    }

    /// Existence probe: an exact sparse-index hit short-circuits to `true`;
    /// otherwise the record is read and its tombstone flag consulted.
    pub fn has(&mut self, key: &Value) -> Result<bool> {
        if self.index.has(key) {
            return Ok(true);
        }
        Ok(match self.read_key(key)? {
            Some(node) => !node.deleted(),
            None => false,
        })
    }

    /// Timed point read of the smallest key; `None` when the table is
    /// empty or the read fails.
    pub fn ping(&mut self) -> Option<Duration> {
        let min_key = self.min_key.clone()?;
        let started = Instant::now();
        match self.read_key(&min_key) {
            Ok(Some(_)) => Some(started.elapsed()),
            _ => None,
        }
    }

    /// Closes the table, flushing nothing: all writes are already durable.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// Closes and deletes the data file and both sidecars.
    pub fn unlink(self) -> Result<()> {
        let paths = [&self.path, &self.index_path, &self.bloom_path];
        for path in paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(crate::error::Error::IO(format!(
                        "unlink {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        tracing::info!(path = %self.path.display(), "table unlinked");
        Ok(())
    }

    pub fn min_key(&self) -> Option<&Value> {
        self.min_key.as_ref()
    }

    pub fn max_key(&self) -> Option<&Value> {
        self.max_key.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// `(hits, misses)` of the block cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    /// Adds record `i` to the bloom filter and, on a block boundary, to the
    /// sparse index.
    fn account_record(&mut self, i: usize, node: &DataNode) {
        if i % self.options.block_size == 0 {
            let offset = self.data_start + (i * self.record_width) as u64;
            self.index.set(node.key().clone(), offset);
        }
        self.bloom.add(node.key());
    }

    fn check_ascending(&self, records: &[DataNode], floor: Option<&Value>) -> Result<()> {
        let mut previous = floor.cloned();
        for node in records {
            if node.key_type() != &self.options.key_type
                || node.value_type() != &self.options.value_type
            {
                return errtype!(
                    "record types {}/{} do not match table types {}/{}",
                    node.key_type(),
                    node.value_type(),
                    self.options.key_type,
                    self.options.value_type
                );
            }
            if let Some(prev) = &previous {
                if node.key() <= prev {
                    return errinvariant!(
                        "records must arrive in ascending key order: {} after {prev}",
                        node.key()
                    );
                }
            }
            previous = Some(node.key().clone());
        }
        Ok(())
    }

    /// Reads one block through the cache. `offset` is the absolute file
    /// offset of the block's first record; the block spans at most
    /// `block_size` records and is bounded by the end of the data region.
    fn read_block(&mut self, offset: u64) -> Result<Vec<u8>> {
        if let Some(cached) = self.cache.get(offset) {
            return Ok(cached.to_vec());
        }

        let end = self.data_start + (self.len * self.record_width) as u64;
        let max_block = (self.options.block_size * self.record_width) as u64;
        let length = max_block.min(end.saturating_sub(offset));
        let mut buf = vec![0u8; length as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| crate::error::Error::IO(format!("read {}: {e}", self.path.display())))?;

        self.cache.put(offset, buf.clone());
        Ok(buf)
    }

    /// Reads and decodes the record at index `i`, bypassing the cache.
    fn read_record_at(&mut self, i: usize) -> Result<DataNode> {
        let offset = self.data_start + (i * self.record_width) as u64;
        let mut buf = vec![0u8; self.record_width];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| crate::error::Error::IO(format!("read {}: {e}", self.path.display())))?;
        DataNode::decode_record(
            &buf,
            self.options.key_type,
            self.options.value_type,
            offset as i64,
        )
    }

    /// Rebuilds index and bloom by scanning the data file.
    fn rebuild_sidecars(&mut self) -> Result<()> {
        self.index.clear();
        self.bloom.clear();
        for i in 0..self.len {
            let node = self.read_record_at(i)?;
            self.account_record(i, &node);
        }
        Ok(())
    }

    fn persist_sidecars(&self) -> Result<()> {
        let index_bytes = self.index.serialize(&self.options.key_type)?;
        std::fs::write(&self.index_path, index_bytes).map_err(|e| {
            crate::error::Error::IO(format!("write {}: {e}", self.index_path.display()))
        })?;
        std::fs::write(&self.bloom_path, self.bloom.bit_array().as_bytes()).map_err(|e| {
            crate::error::Error::IO(format!("write {}: {e}", self.bloom_path.display()))
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("records", &self.len)
            .field("min_key", &self.min_key)
            .field("max_key", &self.max_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tmpfs::TempDir;
    use crate::types::FieldType;

    fn u32_options() -> TableOptions {
        TableOptions::new(FieldType::U32, FieldType::U32)
            .size(1000)
            .block_size(100)
    }

    fn node(key: u32, value: u32, ts: u64) -> DataNode {
        DataNode::new(
            Value::U32(key),
            Value::U32(value),
            FieldType::U32,
            FieldType::U32,
            ts,
            false,
        )
        .expect("node construction failed")
    }

    fn nodes(pairs: &[(u32, u32)]) -> Vec<DataNode> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, (k, v))| node(*k, *v, 1_700_000_000_000 + i as u64))
            .collect()
    }

    #[test]
    fn test_empty_table_on_disk_bytes() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        let _table = SSTable::open(&path, u32_options()).expect("Failed to open table");

        let bytes = std::fs::read(&path).expect("read failed");
        assert_eq!(
            bytes,
            [0x05, 0x53, 0x53, 0x54, 0x54, 0x01, 0x03, 0x0A, 0x0A, 0x21, 0x0A]
        );
        assert_eq!(bytes.len(), 11);
    }

    #[test]
    fn test_single_insert_and_read() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
        let record = DataNode::new(
            Value::U32(7),
            Value::U32(42),
            FieldType::U32,
            FieldType::U32,
            1_700_000_000_000,
            false,
        )
        .expect("node construction failed");
        table.write(&[record]).expect("write failed");

        // The record starts right after the 11-byte header.
        let bytes = std::fs::read(&path).expect("read failed");
        assert_eq!(bytes.len(), 11 + 33);
        assert_eq!(
            &bytes[11..31],
            &[
                0x53, 0x54, 0x41, 0x52, 0x04, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x07,
                0x00, 0x00, 0x00, 0x2A, 0x00, 0x00, 0x00
            ]
        );

        let found = table
            .read_key(&Value::U32(7))
            .expect("read failed")
            .expect("key 7 must be present");
        assert_eq!(found.value(), &Value::U32(42));
        assert_eq!(found.offset(), 11);

        assert!(table
            .read_key(&Value::U32(8))
            .expect("read failed")
            .is_none());
    }

    #[test]
    fn test_multi_block_reads() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");
        let options = TableOptions::new(FieldType::U32, FieldType::U32)
            .size(1000)
            .block_size(10);

        let mut table = SSTable::open(&path, options).expect("Failed to open table");
        let records = nodes(&(0..250).map(|i| (i * 2, i * 20)).collect::<Vec<_>>());
        table.write(&records).expect("write failed");

        // One index entry per 10 records.
        assert_eq!(table.len(), 250);
        for key in [0u32, 18, 20, 377 * 2 / 2, 498] {
            let result = table.read_key(&Value::U32(key)).expect("read failed");
            if key % 2 == 0 && key < 500 {
                let found = result.expect("even key must be present");
                assert_eq!(found.value(), &Value::U32(key * 10));
            } else {
                assert!(result.is_none(), "odd key {key} must be absent");
            }
        }
    }

    #[test]
    fn test_capacity_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");
        let options = TableOptions::new(FieldType::U32, FieldType::U32)
            .size(4)
            .block_size(2);

        let mut table = SSTable::open(&path, options).expect("Failed to open table");
        let records = nodes(&[(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]);
        match table.write(&records) {
            Err(Error::Capacity {
                declared,
                requested,
            }) => {
                assert_eq!(declared, 4);
                assert_eq!(requested, 5);
            }
            other => panic!("expected capacity error, got {other:?}"),
        }
    }

    #[test]
    fn test_unordered_records_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
        assert!(table.write(&nodes(&[(2, 2), (1, 1)])).is_err());
    }

    #[test]
    fn test_reopen_with_sidecars() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        {
            let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
            table
                .write(&nodes(&[(1, 10), (5, 50), (9, 90)]))
                .expect("write failed");
        }
        assert!(path.with_extension("idx").exists());
        assert!(path.with_extension("bloom").exists());

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to reopen table");
        assert_eq!(table.len(), 3);
        assert_eq!(table.min_key(), Some(&Value::U32(1)));
        assert_eq!(table.max_key(), Some(&Value::U32(9)));

        let found = table
            .read_key(&Value::U32(5))
            .expect("read failed")
            .expect("key 5 must be present");
        assert_eq!(found.value(), &Value::U32(50));
    }

    #[test]
    fn test_reopen_rebuilds_missing_sidecars() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        {
            let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
            table
                .write(&nodes(&[(1, 10), (5, 50)]))
                .expect("write failed");
        }
        std::fs::remove_file(path.with_extension("idx")).expect("remove failed");
        std::fs::remove_file(path.with_extension("bloom")).expect("remove failed");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to reopen table");
        let found = table
            .read_key(&Value::U32(5))
            .expect("read failed")
            .expect("key 5 must be present after rebuild");
        assert_eq!(found.value(), &Value::U32(50));
        assert!(path.with_extension("idx").exists());
    }

    #[test]
    fn test_reopen_reads_legacy_text_index() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        {
            let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
            table
                .write(&nodes(&[(1, 10), (5, 50)]))
                .expect("write failed");
        }
        // Rewrite the index sidecar in the pre-migration text form.
        std::fs::write(path.with_extension("idx"), b"1,11").expect("write failed");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to reopen table");
        let found = table
            .read_key(&Value::U32(5))
            .expect("read failed")
            .expect("key 5 must be readable through the legacy index");
        assert_eq!(found.value(), &Value::U32(50));
    }

    #[test]
    fn test_invariant_error_on_bad_index_offset() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        {
            let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
            table.write(&nodes(&[(1, 10)])).expect("write failed");
        }
        // An offset far beyond EOF must be rejected on open.
        std::fs::write(path.with_extension("idx"), b"1,9999").expect("write failed");

        match SSTable::open(&path, u32_options()) {
            Err(Error::Invariant(_)) => {}
            other => panic!("expected invariant error, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_errors() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        // Wrong magic.
        let path = dir.path().join("magic.sst");
        std::fs::write(&path, [0x05, b'X', b'X', b'X', b'X', 0x01, 0x03, 0x0A, 0x0A, 0x21, 0x0A])
            .expect("write failed");
        assert!(matches!(
            SSTable::open(&path, u32_options()),
            Err(Error::Format(_))
        ));

        // Unsupported version.
        let path = dir.path().join("version.sst");
        std::fs::write(&path, [0x05, 0x53, 0x53, 0x54, 0x54, 0x09, 0x03, 0x0A, 0x0A, 0x21, 0x0A])
            .expect("write failed");
        assert!(matches!(
            SSTable::open(&path, u32_options()),
            Err(Error::Format(_))
        ));

        // Key/value tags that disagree with the declared types.
        let path = dir.path().join("tags.sst");
        std::fs::write(&path, [0x05, 0x53, 0x53, 0x54, 0x54, 0x01, 0x03, 0x0C, 0x0C, 0x29, 0x0A])
            .expect("write failed");
        assert!(matches!(
            SSTable::open(&path, u32_options()),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn test_append_extends_and_keeps_bounds_monotonic() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
        table
            .write(&nodes(&[(1, 10), (2, 20)]))
            .expect("write failed");
        table
            .append(&nodes(&[(3, 30), (4, 40)]))
            .expect("append failed");

        assert_eq!(table.len(), 4);
        assert_eq!(table.min_key(), Some(&Value::U32(1)));
        assert_eq!(table.max_key(), Some(&Value::U32(4)));

        let found = table
            .read_key(&Value::U32(4))
            .expect("read failed")
            .expect("appended key must be readable");
        assert_eq!(found.value(), &Value::U32(40));

        // Appending below the current max violates the ordering contract.
        assert!(table.append(&nodes(&[(0, 0)])).is_err());
    }

    #[test]
    fn test_read_first_n() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
        table
            .write(&nodes(&[(1, 10), (2, 20), (3, 30)]))
            .expect("write failed");

        let first_two = table.read_first_n(2).expect("read failed");
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].key(), &Value::U32(1));
        assert_eq!(first_two[1].key(), &Value::U32(2));

        // Requests past the end clamp to the record count.
        assert_eq!(table.read_first_n(99).expect("read failed").len(), 3);
        assert_eq!(table.read_all().expect("read failed").len(), 3);
    }

    #[test]
    fn test_persisted_index_is_ascending_and_aligned() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");
        let options = TableOptions::new(FieldType::U32, FieldType::U32)
            .size(100)
            .block_size(4);

        let mut table = SSTable::open(&path, options).expect("Failed to open table");
        let records = nodes(&(0..25u32).map(|i| (i * 3, i)).collect::<Vec<_>>());
        table.write(&records).expect("write failed");

        let bytes = std::fs::read(path.with_extension("idx")).expect("read failed");
        let index =
            SortedArray::deserialize(&bytes, &FieldType::U32).expect("deserialize failed");

        // One entry per block of 4 records.
        assert_eq!(index.len(), 7);
        let mut previous: Option<Value> = None;
        for (key, offset) in index.iter() {
            if let Some(prev) = &previous {
                assert!(key > prev, "index keys must ascend");
            }
            assert!(offset >= 11);
            assert_eq!(
                (offset - 11) % 33,
                0,
                "offsets must align to the record stride"
            );
            previous = Some(key.clone());
        }
    }

    #[test]
    fn test_may_have_and_has() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");
        let options = TableOptions::new(FieldType::U32, FieldType::U32)
            .size(100)
            .block_size(2);

        let mut table = SSTable::open(&path, options).expect("Failed to open table");
        table
            .write(&nodes(&[(1, 10), (2, 20), (3, 30)]))
            .expect("write failed");

        assert!(table.may_have(&Value::U32(2)));
        assert!(table.has(&Value::U32(2)).expect("has failed"));
        assert!(!table.has(&Value::U32(7)).expect("has failed"));
    }

    #[test]
    fn test_tombstone_read_back() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
        let live = node(5, 100, 1_700_000_000_000);
        let dead = DataNode::tombstone(
            Value::U32(6),
            FieldType::U32,
            FieldType::U32,
            1_700_000_000_001,
        )
        .expect("tombstone construction failed");
        table.write(&[live, dead]).expect("write failed");

        let found = table
            .read_key(&Value::U32(6))
            .expect("read failed")
            .expect("tombstone record must decode");
        assert!(found.deleted());
        assert!(!table.has(&Value::U32(6)).expect("has failed"));
    }

    #[test]
    fn test_block_cache_serves_repeat_reads() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");
        let options = TableOptions::new(FieldType::U32, FieldType::U32)
            .size(100)
            .block_size(4);

        let mut table = SSTable::open(&path, options).expect("Failed to open table");
        table
            .write(&nodes(&[(1, 10), (2, 20), (3, 30), (4, 40)]))
            .expect("write failed");

        table.read_key(&Value::U32(2)).expect("read failed");
        let (hits_before, _) = table.cache_stats();
        table.read_key(&Value::U32(3)).expect("read failed");
        let (hits_after, _) = table.cache_stats();
        assert!(
            hits_after > hits_before,
            "second read of the same block must hit the cache"
        );
    }

    #[test]
    fn test_ping() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
        assert!(table.ping().is_none(), "empty table has nothing to ping");

        table.write(&nodes(&[(1, 10)])).expect("write failed");
        assert!(table.ping().is_some());
    }

    #[test]
    fn test_unlink_removes_all_three_files() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("0.sst");

        let mut table = SSTable::open(&path, u32_options()).expect("Failed to open table");
        table.write(&nodes(&[(1, 10)])).expect("write failed");

        let index_path = path.with_extension("idx");
        let bloom_path = path.with_extension("bloom");
        assert!(index_path.exists() && bloom_path.exists());

        table.unlink().expect("unlink failed");
        assert!(!path.exists());
        assert!(!index_path.exists());
        assert!(!bloom_path.exists());
    }

    #[test]
    fn test_wide_records_need_version_2() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        // str:256 keys push the record width past the one-byte field.
        let v1 = TableOptions::new(FieldType::Str(256), FieldType::U32).size(10);
        let path = dir.path().join("v1.sst");
        assert!(matches!(
            SSTable::open(&path, v1),
            Err(Error::Format(_))
        ));

        let v2 = TableOptions::new(FieldType::Str(256), FieldType::U32)
            .size(10)
            .version(2);
        let path = dir.path().join("v2.sst");
        let mut table = SSTable::open(&path, v2.clone()).expect("Failed to open v2 table");
        assert_eq!(table.version(), 2);

        let record = DataNode::new(
            Value::Str("wide".into()),
            Value::U32(1),
            FieldType::Str(256),
            FieldType::U32,
            1_700_000_000_000,
            false,
        )
        .expect("node construction failed");
        table.write(&[record]).expect("write failed");

        // Header: 05 "SSTT" 02, metadata length 4, width 285 as u16 LE.
        let bytes = std::fs::read(&path).expect("read failed");
        assert_eq!(bytes[5], 0x02);
        assert_eq!(bytes[6], 0x04);
        assert_eq!(&bytes[9..11], &285u16.to_le_bytes());
        assert_eq!(bytes[11], 0x0A);

        let mut table = SSTable::open(&path, v2).expect("Failed to reopen v2 table");
        let found = table
            .read_key(&Value::Str("wide".into()))
            .expect("read failed")
            .expect("key must be present");
        assert_eq!(found.value(), &Value::U32(1));
    }
}
