//! Logical records and their two wire forms.
//!
//! A [`DataNode`] is one keyed datum: typed key and value, timestamp,
//! tombstone flag, and the pre-encoded concatenation of key and value
//! bytes. The same node serializes into two framings:
//!
//! ```text
//! table record:
//! +------+-----------+-----------+-----+-------+---------+---------+------+
//! | STAR |key_len:u32|val_len:u32| key | value | ts: f64 |deleted:1| ENDE |
//! +------+-----------+-----------+-----+-------+---------+---------+------+
//! |  4   |     4     |     4     | var |  var  |    8    |    1    |  4   |
//! +------+-----------+-----------+-----+-------+---------+---------+------+
//!
//! WAL record:
//! +-------------+------+------+-----------+-----------+-----+-------+---------+--------+-------------+
//! | 01 10 EF FE |kt: u8|vt: u8|key_len:u32|val_len:u32| key | value | ts: f64 |method:1| FE EF 10 01 |
//! +-------------+------+------+-----------+-----------+-----+-------+---------+--------+-------------+
//! ```
//!
//! All integers are little-endian; the timestamp is the millisecond count
//! written as a binary64 bit pattern. A table record of a
//! `(key_type, value_type)` pair always occupies
//! `25 + width(key_type) + width(value_type)` bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::types::{decode_timestamp, encode_timestamp, FieldType, Value};
use crate::{errformat, errtype};

/// Table record start delimiter, ASCII `STAR`.
pub const RECORD_START: [u8; 4] = [0x53, 0x54, 0x41, 0x52];
/// Table record end delimiter, ASCII `ENDE`.
pub const RECORD_END: [u8; 4] = [0x45, 0x4E, 0x44, 0x45];
/// WAL record start delimiter.
pub const WAL_START: [u8; 4] = [0x01, 0x10, 0xEF, 0xFE];
/// WAL record end delimiter.
pub const WAL_END: [u8; 4] = [0xFE, 0xEF, 0x10, 0x01];

/// Fixed overhead of a table record: delimiters, length fields, timestamp,
/// and the tombstone flag.
pub const RECORD_FRAME: usize = 25;

/// Fixed overhead of a WAL record: the table-record frame plus the two
/// type-tag bytes.
pub const WAL_FRAME: usize = RECORD_FRAME + 2;

/// Total encoded size of a table record for a type pair.
pub fn record_width(key_type: &FieldType, value_type: &FieldType) -> usize {
    RECORD_FRAME + key_type.width() + value_type.width()
}

/// Operation byte carried by WAL records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalMethod {
    Append = 0,
    Delete = 1,
}

impl WalMethod {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(WalMethod::Append),
            1 => Ok(WalMethod::Delete),
            other => errformat!("invalid WAL method byte 0x{other:02X}"),
        }
    }
}

/// One logical record.
#[derive(Debug, Clone)]
pub struct DataNode {
    key: Value,
    value: Value,
    key_type: FieldType,
    value_type: FieldType,
    /// Milliseconds since the epoch; always positive for produced records.
    timestamp: u64,
    deleted: bool,
    /// Byte offset of the record in its table file, or -1 in memory.
    offset: i64,
    /// Pre-encoded key bytes followed by value bytes.
    data_buffer: Vec<u8>,
}

impl DataNode {
    pub fn new(
        key: Value,
        value: Value,
        key_type: FieldType,
        value_type: FieldType,
        timestamp: u64,
        deleted: bool,
    ) -> Result<Self> {
        if timestamp == 0 {
            return errtype!("record timestamp must be positive");
        }
        let mut data_buffer = Vec::with_capacity(key_type.width() + value_type.width());
        key_type.encode_into(&key, &mut data_buffer)?;
        value_type.encode_into(&value, &mut data_buffer)?;

        Ok(Self {
            key,
            value,
            key_type,
            value_type,
            timestamp,
            deleted,
            offset: -1,
            data_buffer,
        })
    }

    /// A deletion marker: carries the zero value of the declared value type.
    pub fn tombstone(
        key: Value,
        key_type: FieldType,
        value_type: FieldType,
        timestamp: u64,
    ) -> Result<Self> {
        Self::new(
            key,
            value_type.sentinel(),
            key_type,
            value_type,
            timestamp,
            true,
        )
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn key_type(&self) -> &FieldType {
        &self.key_type
    }

    pub fn value_type(&self) -> &FieldType {
        &self.value_type
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    pub(crate) fn key_bytes(&self) -> &[u8] {
        &self.data_buffer[..self.key_type.width()]
    }

    pub(crate) fn value_bytes(&self) -> &[u8] {
        &self.data_buffer[self.key_type.width()..]
    }

    /// Encodes into the packed table-record form.
    pub fn encode_record(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(record_width(&self.key_type, &self.value_type));
        buf.extend_from_slice(&RECORD_START);
        buf.write_u32::<LittleEndian>(self.key_type.width() as u32)?;
        buf.write_u32::<LittleEndian>(self.value_type.width() as u32)?;
        buf.extend_from_slice(&self.data_buffer);
        buf.extend_from_slice(&encode_timestamp(self.timestamp));
        buf.push(u8::from(self.deleted));
        buf.extend_from_slice(&RECORD_END);
        Ok(buf)
    }

    /// Decodes a packed table record. `offset` is the record's position in
    /// the table file and is recorded on the node.
    pub fn decode_record(
        bytes: &[u8],
        key_type: FieldType,
        value_type: FieldType,
        offset: i64,
    ) -> Result<Self> {
        let expected = record_width(&key_type, &value_type);
        if bytes.len() != expected {
            return errformat!(
                "table record at offset {offset}: expected {expected} bytes, got {}",
                bytes.len()
            );
        }
        if bytes[..4] != RECORD_START {
            return errformat!(
                "table record at offset {offset}: bad start delimiter {:02X?}",
                &bytes[..4]
            );
        }
        if bytes[expected - 4..] != RECORD_END {
            return errformat!(
                "table record at offset {offset}: bad end delimiter {:02X?}",
                &bytes[expected - 4..]
            );
        }

        let mut r = &bytes[4..];
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        let value_len = r.read_u32::<LittleEndian>()? as usize;
        if key_len != key_type.width() || value_len != value_type.width() {
            return errtype!(
                "table record at offset {offset}: declared widths {key_len}/{value_len} disagree \
                 with types {key_type}/{value_type}"
            );
        }

        let data_buffer = bytes[12..12 + key_len + value_len].to_vec();
        let key = key_type.decode(&data_buffer[..key_len])?;
        let value = value_type.decode(&data_buffer[key_len..])?;

        let ts_start = 12 + key_len + value_len;
        let timestamp = decode_timestamp(bytes[ts_start..ts_start + 8].try_into().unwrap());
        let deleted = match bytes[ts_start + 8] {
            0 => false,
            1 => true,
            other => {
                return errformat!(
                    "table record at offset {offset}: invalid tombstone byte 0x{other:02X}"
                )
            }
        };

        Ok(Self {
            key,
            value,
            key_type,
            value_type,
            timestamp,
            deleted,
            offset,
            data_buffer,
        })
    }

    /// Encodes into the WAL record form for the given operation.
    pub fn encode_wal_record(&self, method: WalMethod) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(WAL_FRAME + self.data_buffer.len());
        buf.extend_from_slice(&WAL_START);
        buf.push(self.key_type.tag());
        buf.push(self.value_type.tag());
        buf.write_u32::<LittleEndian>(self.key_type.width() as u32)?;
        buf.write_u32::<LittleEndian>(self.value_type.width() as u32)?;
        buf.extend_from_slice(&self.data_buffer);
        buf.extend_from_slice(&encode_timestamp(self.timestamp));
        buf.push(method as u8);
        buf.extend_from_slice(&WAL_END);
        Ok(buf)
    }
}
