//! Append-ordered associative container used as the sparse index of a
//! table: one `(first_key_of_block, block_offset)` entry per data block.
//!
//! The write path appends entries in non-decreasing key order, so `set` is
//! O(1) amortized; the bound queries (`lower_bound`, `upper_bound`,
//! `greatest_le`) binary-search the stored entries in O(log n).
//!
//! ## Sidecar serialization
//!
//! New `.idx` sidecars are binary: the magic `SIDX`, then one fixed-width
//! encoded key followed by a u64 LE offset per entry, then a CRC-32 (ISCSI)
//! of everything after the magic. Sidecars written by earlier versions are
//! a `key,offset,key,offset,...` text file; files that do not start with
//! the magic are parsed as that legacy format.

use std::cmp::Ordering;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errformat;
use crate::error::Result;
use crate::types::{FieldType, Value};

const INDEX_MAGIC: &[u8; 4] = b"SIDX";
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Sorted `(key, offset)` entries with binary-searched bound queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedArray {
    entries: Vec<(Value, u64)>,
}

impl SortedArray {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts or overwrites an entry. Appending in key order is O(1);
    /// out-of-order keys fall back to a binary-searched insertion.
    pub fn set(&mut self, key: Value, offset: u64) {
        match self.entries.last() {
            None => self.entries.push((key, offset)),
            Some((last, _)) => match last.cmp(&key) {
                Ordering::Less => self.entries.push((key, offset)),
                Ordering::Equal => {
                    let idx = self.entries.len() - 1;
                    self.entries[idx].1 = offset;
                }
                Ordering::Greater => match self.search(&key) {
                    Ok(idx) => self.entries[idx].1 = offset,
                    Err(idx) => self.entries.insert(idx, (key, offset)),
                },
            },
        }
    }

    pub fn get(&self, key: &Value) -> Option<u64> {
        self.search(key).ok().map(|idx| self.entries[idx].1)
    }

    pub fn has(&self, key: &Value) -> bool {
        self.search(key).is_ok()
    }

    pub fn at(&self, idx: usize) -> Option<(&Value, u64)> {
        self.entries.get(idx).map(|(k, o)| (k, *o))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Smallest entry with key >= `key`.
    pub fn lower_bound(&self, key: &Value) -> Option<(&Value, u64)> {
        let idx = match self.search(key) {
            Ok(idx) => idx,
            Err(idx) => idx,
        };
        self.at(idx)
    }

    /// Smallest entry with key > `key`.
    pub fn upper_bound(&self, key: &Value) -> Option<(&Value, u64)> {
        let idx = match self.search(key) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        };
        self.at(idx)
    }

    /// Largest entry with key <= `key`. For any key stored in the table,
    /// this yields the block that contains it.
    pub fn greatest_le(&self, key: &Value) -> Option<(&Value, u64)> {
        match self.search(key) {
            Ok(idx) => self.at(idx),
            // `idx` is the insertion point; the entry before it (if any) is
            // the greatest key still <= the target.
            Err(0) => None,
            Err(idx) => self.at(idx - 1),
        }
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, u64)> {
        self.entries.iter().map(|(k, o)| (k, *o))
    }

    fn search(&self, key: &Value) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }

    /// Serializes to the binary sidecar format.
    pub fn serialize(&self, key_type: &FieldType) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.entries.len() * (key_type.width() + 8));
        for (key, offset) in &self.entries {
            key_type.encode_into(key, &mut body)?;
            body.write_u64::<LittleEndian>(*offset)?;
        }
        let mut buf = Vec::with_capacity(4 + body.len() + 4);
        buf.extend_from_slice(INDEX_MAGIC);
        buf.extend_from_slice(&body);
        buf.write_u32::<LittleEndian>(CRC32.checksum(&body))?;
        Ok(buf)
    }

    /// Deserializes a sidecar, accepting both the binary format and the
    /// legacy `key,offset,...` text format.
    pub fn deserialize(bytes: &[u8], key_type: &FieldType) -> Result<Self> {
        if bytes.starts_with(INDEX_MAGIC) {
            Self::deserialize_binary(&bytes[INDEX_MAGIC.len()..], key_type)
        } else {
            Self::deserialize_text(bytes, key_type)
        }
    }

    fn deserialize_binary(bytes: &[u8], key_type: &FieldType) -> Result<Self> {
        if bytes.len() < 4 {
            return errformat!("index sidecar truncated: missing checksum");
        }
        let (body, mut trailer) = bytes.split_at(bytes.len() - 4);
        let stored = trailer.read_u32::<LittleEndian>()?;
        let computed = CRC32.checksum(body);
        if stored != computed {
            return errformat!(
                "index sidecar checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}"
            );
        }

        let stride = key_type.width() + 8;
        if body.len() % stride != 0 {
            return errformat!(
                "index sidecar body of {} bytes is not a multiple of the {stride}-byte entry",
                body.len()
            );
        }

        let mut array = Self::new();
        for chunk in body.chunks_exact(stride) {
            let key = key_type.decode(&chunk[..key_type.width()])?;
            let offset = (&chunk[key_type.width()..]).read_u64::<LittleEndian>()?;
            array.set(key, offset);
        }
        Ok(array)
    }

    fn deserialize_text(bytes: &[u8], key_type: &FieldType) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| crate::error::Error::Format(format!("index sidecar is not UTF-8: {e}")))?;

        let mut array = Self::new();
        let mut fields = text.split(',').filter(|s| !s.is_empty());
        while let Some(key_text) = fields.next() {
            let offset_text = fields
                .next()
                .ok_or_else(|| {
                    crate::error::Error::Format(format!(
                        "index sidecar has a key {key_text:?} without an offset"
                    ))
                })?;
            let key = key_type.parse(key_text.trim())?;
            let offset = offset_text.trim().parse::<u64>().map_err(|_| {
                crate::error::Error::Format(format!("invalid index offset {offset_text:?}"))
            })?;
            array.set(key, offset);
        }
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_index() -> SortedArray {
        let mut index = SortedArray::new();
        index.set(Value::U32(10), 11);
        index.set(Value::U32(20), 341);
        index.set(Value::U32(30), 671);
        index
    }

    #[test]
    fn test_set_and_get() {
        let index = create_test_index();
        assert_eq!(index.get(&Value::U32(20)), Some(341));
        assert_eq!(index.get(&Value::U32(25)), None);
        assert!(index.has(&Value::U32(10)));
        assert!(!index.has(&Value::U32(11)));
    }

    #[test]
    fn test_overwrite_in_place() {
        let mut index = create_test_index();
        index.set(Value::U32(20), 999);
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(&Value::U32(20)), Some(999));
    }

    #[test]
    fn test_out_of_order_insert() {
        let mut index = create_test_index();
        index.set(Value::U32(15), 123);
        assert_eq!(index.len(), 4);
        let keys: Vec<_> = index.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                Value::U32(10),
                Value::U32(15),
                Value::U32(20),
                Value::U32(30)
            ]
        );
    }

    #[test]
    fn test_lower_bound() {
        let index = create_test_index();
        assert_eq!(index.lower_bound(&Value::U32(20)).unwrap().1, 341);
        assert_eq!(index.lower_bound(&Value::U32(21)).unwrap().1, 671);
        assert!(index.lower_bound(&Value::U32(31)).is_none());
    }

    #[test]
    fn test_upper_bound() {
        let index = create_test_index();
        assert_eq!(index.upper_bound(&Value::U32(20)).unwrap().1, 671);
        assert_eq!(index.upper_bound(&Value::U32(5)).unwrap().1, 11);
        assert!(index.upper_bound(&Value::U32(30)).is_none());
    }

    #[test]
    fn test_greatest_le() {
        let index = create_test_index();
        // Exact match.
        assert_eq!(index.greatest_le(&Value::U32(20)).unwrap().1, 341);
        // Between entries: the preceding block wins.
        assert_eq!(index.greatest_le(&Value::U32(25)).unwrap().1, 341);
        // Larger than all entries: the last block wins.
        assert_eq!(index.greatest_le(&Value::U32(99)).unwrap().1, 671);
        // Smaller than all entries.
        assert!(index.greatest_le(&Value::U32(5)).is_none());
    }

    #[test]
    fn test_greatest_le_empty() {
        let index = SortedArray::new();
        assert!(index.greatest_le(&Value::U32(1)).is_none());
    }

    #[test]
    fn test_binary_serialization_roundtrip() {
        let index = create_test_index();
        let buf = index.serialize(&FieldType::U32).expect("serialize failed");
        assert!(buf.starts_with(b"SIDX"));

        let decoded =
            SortedArray::deserialize(&buf, &FieldType::U32).expect("deserialize failed");
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_binary_checksum_mismatch() {
        let index = create_test_index();
        let mut buf = index.serialize(&FieldType::U32).expect("serialize failed");
        buf[6] ^= 0xFF;
        assert!(SortedArray::deserialize(&buf, &FieldType::U32).is_err());
    }

    #[test]
    fn test_legacy_text_format() {
        let text = b"10,11,20,341,30,671";
        let decoded =
            SortedArray::deserialize(text, &FieldType::U32).expect("legacy parse failed");
        assert_eq!(decoded, create_test_index());
    }

    #[test]
    fn test_legacy_text_string_keys() {
        let text = b"alpha,11,beta,341";
        let decoded =
            SortedArray::deserialize(text, &FieldType::Str(8)).expect("legacy parse failed");
        assert_eq!(decoded.get(&Value::Str("beta".into())), Some(341));
    }

    #[test]
    fn test_legacy_text_dangling_key() {
        assert!(SortedArray::deserialize(b"10,11,20", &FieldType::U32).is_err());
    }

    #[test]
    fn test_clear() {
        let mut index = create_test_index();
        index.clear();
        assert!(index.is_empty());
        assert!(index.get(&Value::U32(10)).is_none());
    }
}
