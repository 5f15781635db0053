//! Write-ahead log: an append-only stream of operation records written
//! before every memtable mutation, so a crash can be recovered by replay.
//!
//! # File format
//!
//! ```text
//! +---------------------+
//! | 0x01 | "WALF"       |  5-byte prefix: header-length byte + magic
//! +---------------------+
//! | WAL record 1        |
//! +---------------------+
//! | WAL record 2        |
//! +---------------------+
//! | ...                 |
//! +---------------------+
//! ```
//!
//! Records use the framing defined in [`crate::record`]: start delimiter,
//! type tags, explicit key/value lengths, payload, timestamp, method byte,
//! end delimiter. Appends go through the buffered [`Appender`] and reach
//! disk when `wal_buffer_size` bytes have accumulated, on flush, or on
//! drop.
//!
//! Replay scans sequentially and validates every delimiter and tag. The
//! first malformed record is treated as the end of the log rather than an
//! error, which makes a torn final write survivable; everything before it
//! is reinserted with its original timestamp and tombstone flag.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::appender::Appender;
use crate::errformat;
use crate::error::Result;
use crate::memtable::Memtable;
use crate::record::{DataNode, WalMethod, WAL_END, WAL_START};
use crate::types::{decode_timestamp, FieldType};

const WAL_MAGIC: [u8; 4] = [0x57, 0x41, 0x4C, 0x46]; // "WALF"
const WAL_PREFIX_LEN: u64 = 5;

/// Guard against allocating absurd buffers when a length field is garbage.
const MAX_FIELD_BYTES: usize = 1 << 20;

pub struct Wal {
    appender: Appender,
    path: PathBuf,
}

impl Wal {
    /// Opens or creates the log. A fresh file gets the 5-byte prefix; an
    /// existing file has its prefix validated.
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        let mut appender = Appender::open(path, buffer_size)?;

        if appender.size() == 0 {
            appender.append(&[0x01])?;
            appender.append(&WAL_MAGIC)?;
            appender.flush()?;
        } else {
            Self::validate_prefix(path)?;
        }

        Ok(Self {
            appender,
            path: path.to_path_buf(),
        })
    }

    fn validate_prefix(path: &Path) -> Result<()> {
        let mut file = File::open(path)
            .map_err(|e| crate::error::Error::IO(format!("open {}: {e}", path.display())))?;
        let mut prefix = [0u8; WAL_PREFIX_LEN as usize];
        file.read_exact(&mut prefix).map_err(|e| {
            crate::error::Error::Format(format!("{}: WAL prefix unreadable: {e}", path.display()))
        })?;
        if prefix[0] != 0x01 {
            return errformat!(
                "{}: bad WAL header length byte 0x{:02X}",
                path.display(),
                prefix[0]
            );
        }
        if prefix[1..] != WAL_MAGIC {
            return errformat!(
                "{}: bad WAL magic {:02X?}, expected {WAL_MAGIC:02X?}",
                path.display(),
                &prefix[1..]
            );
        }
        Ok(())
    }

    /// Appends one operation record. This is the commit point of a write:
    /// once the record is in the log, recovery will apply it.
    pub fn append(&mut self, node: &DataNode, method: WalMethod) -> Result<()> {
        let record = node.encode_wal_record(method)?;
        self.appender.append(&record)
    }

    /// Replays the log into `memtable`, returning the number of records
    /// applied. Decoding stops at the first malformed record.
    pub fn replay(&mut self, memtable: &Memtable) -> Result<usize> {
        self.appender.flush()?;

        let file = File::open(&self.path)
            .map_err(|e| crate::error::Error::IO(format!("open {}: {e}", self.path.display())))?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(WAL_PREFIX_LEN))?;

        let mut applied = 0usize;
        loop {
            match Self::read_record(&mut reader) {
                Ok(Some((node, _method))) => {
                    memtable.insert(node);
                    applied += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    // Torn or corrupt tail: everything before it is intact.
                    tracing::warn!(
                        path = %self.path.display(),
                        applied,
                        error = %err,
                        "WAL replay stopped at malformed record"
                    );
                    break;
                }
            }
        }

        tracing::info!(path = %self.path.display(), applied, "WAL replay complete");
        Ok(applied)
    }

    /// Resets the log to the bare prefix. Called by the pipeline after a
    /// successful flush has made the logged records durable in a table.
    pub fn truncate(&mut self) -> Result<()> {
        self.appender.truncate(WAL_PREFIX_LEN)?;
        tracing::debug!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    /// Flushes staged records to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.appender.flush()
    }

    /// Flushes and fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.appender.sync()
    }

    /// Logical size in bytes, including records still staged.
    pub fn size(&self) -> u64 {
        self.appender.size()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads one record. `Ok(None)` is a clean end of log; any validation
    /// failure is an error the caller treats as the end of usable data.
    fn read_record(reader: &mut BufReader<File>) -> Result<Option<(DataNode, WalMethod)>> {
        let mut start = [0u8; 4];
        match reader.read_exact(&mut start) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if start != WAL_START {
            return errformat!("bad WAL start delimiter {start:02X?}");
        }

        let key_tag = reader.read_u8()?;
        let value_tag = reader.read_u8()?;
        let key_len = reader.read_u32::<LittleEndian>()? as usize;
        let value_len = reader.read_u32::<LittleEndian>()? as usize;
        if key_len > MAX_FIELD_BYTES || value_len > MAX_FIELD_BYTES {
            return errformat!("implausible WAL field lengths {key_len}/{value_len}");
        }

        let key_type = FieldType::from_tag(key_tag, key_len)?;
        let value_type = FieldType::from_tag(value_tag, value_len)?;
        if key_type.width() != key_len || value_type.width() != value_len {
            return errformat!(
                "WAL record widths {key_len}/{value_len} disagree with tags \
                 {key_type}/{value_type}"
            );
        }

        let mut key_bytes = vec![0u8; key_len];
        reader.read_exact(&mut key_bytes)?;
        let mut value_bytes = vec![0u8; value_len];
        reader.read_exact(&mut value_bytes)?;

        let mut ts_bytes = [0u8; 8];
        reader.read_exact(&mut ts_bytes)?;
        let timestamp = decode_timestamp(ts_bytes);

        let method = WalMethod::from_byte(reader.read_u8()?)?;

        let mut end = [0u8; 4];
        reader.read_exact(&mut end)?;
        if end != WAL_END {
            return errformat!("bad WAL end delimiter {end:02X?}");
        }

        let key = key_type.decode(&key_bytes)?;
        let value = value_type.decode(&value_bytes)?;
        let node = DataNode::new(
            key,
            value,
            key_type,
            value_type,
            timestamp,
            method == WalMethod::Delete,
        )?;
        Ok(Some((node, method)))
    }
}
