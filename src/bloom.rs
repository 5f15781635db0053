//! Classical bloom filter over a [`BitArray`], one per table.
//!
//! Sizing follows the usual derivation from the expected record count `n`
//! and the target false-positive rate `p`: the bit count is
//! `n * ln(p) / ln(1 / 2^ln2)` truncated toward zero, and the hash count is
//! `round((m / n) * ln 2)`. For `n = 100, p = 0.01` this yields `m = 958`
//! and `k = 7`.
//!
//! The default hash dispatches on the key shape: strings go through
//! MurmurHash3 (32-bit) seeded per probe, 8-byte payloads through a 64→32
//! mixer that XOR-folds the halves after two multiply–xorshift rounds, and
//! everything else through a single multiply–xorshift round over the value
//! widened to 32 bits. A custom hash may be injected for all shapes.

use std::sync::Arc;

use crate::bitarray::BitArray;
use crate::types::Value;

/// An injectable replacement for the default key hash. Receives the key and
/// the probe index `i in [0, k)`.
pub type KeyHashFn = Arc<dyn Fn(&Value, u32) -> u32 + Send + Sync>;

pub struct BloomFilter {
    bits: BitArray,
    /// Bit positions are taken modulo `m`, which stays fixed at the derived
    /// size even if a reloaded sidecar buffer is larger.
    m: usize,
    k: u32,
    custom_hash: Option<KeyHashFn>,
}

impl BloomFilter {
    /// Creates a filter sized for `expected` keys at `error_rate`.
    pub fn new(expected: usize, error_rate: f64, custom_hash: Option<KeyHashFn>) -> Self {
        let (m, k) = Self::parameters(expected, error_rate);
        Self {
            bits: BitArray::new(m),
            m,
            k,
            custom_hash,
        }
    }

    /// Derives `(m, k)` from the expected key count and error rate.
    pub fn parameters(expected: usize, error_rate: f64) -> (usize, u32) {
        let n = expected.max(1) as f64;
        let denominator = (1.0 / 2f64.powf(std::f64::consts::LN_2)).ln();
        let m = ((n * error_rate.ln() / denominator) as usize).max(8);
        let k = (((m as f64 / n) * std::f64::consts::LN_2).round() as u32).max(1);
        (m, k)
    }

    /// Marks `key` as present.
    pub fn add(&mut self, key: &Value) {
        for i in 0..self.k {
            let bit = self.hash(key, i) as usize % self.m;
            self.bits.set(bit);
        }
    }

    /// Returns `false` if `key` is definitely absent, `true` if it may be
    /// present.
    pub fn lookup(&self, key: &Value) -> bool {
        (0..self.k).all(|i| self.bits.get(self.hash(key, i) as usize % self.m))
    }

    /// Replaces the bit buffer with bytes loaded from a sidecar file. The
    /// buffer length is authoritative for the bit array; `m` keeps its
    /// derived value so probe positions stay stable.
    pub fn load_bits(&mut self, bytes: Vec<u8>) {
        self.bits = BitArray::from_bytes(bytes);
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.bits
    }

    pub fn num_bits(&self) -> usize {
        self.m
    }

    pub fn num_hashes(&self) -> u32 {
        self.k
    }

    fn hash(&self, key: &Value, i: u32) -> u32 {
        if let Some(custom) = &self.custom_hash {
            return custom(key, i);
        }
        match key {
            Value::Str(s) => murmur3_32(s.as_bytes(), i),
            Value::U64(v) => fold64(*v, i),
            Value::I64(v) => fold64(*v as u64, i),
            Value::F64(v) => fold64(v.to_bits(), i),
            Value::Bool(v) => mix32(u32::from(*v), i),
            Value::U8(v) => mix32(u32::from(*v), i),
            Value::I8(v) => mix32(*v as u8 as u32, i),
            Value::U16(v) => mix32(u32::from(*v), i),
            Value::I16(v) => mix32(*v as u16 as u32, i),
            Value::U32(v) => mix32(*v, i),
            Value::I32(v) => mix32(*v as u32, i),
            Value::F32(v) => mix32(v.to_bits(), i),
        }
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("m", &self.m)
            .field("k", &self.k)
            .field("custom_hash", &self.custom_hash.is_some())
            .finish()
    }
}

/// Single multiply–xorshift round over a 32-bit value.
fn mix32(value: u32, seed: u32) -> u32 {
    let mut h = value ^ seed.wrapping_mul(0x9E37_79B9);
    h = h.wrapping_mul(0x85EB_CA6B);
    h ^= h >> 16;
    h
}

/// 64→32 mixer: two multiply–xorshift rounds, then an XOR-fold of the high
/// and low halves.
fn fold64(value: u64, seed: u32) -> u32 {
    let mut h = value ^ u64::from(seed).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    (h as u32) ^ ((h >> 32) as u32)
}

/// MurmurHash3, 32-bit variant.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xCC9E_2D51;
    const C2: u32 = 0x1B87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xE654_6B64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= u32::from(b) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85EB_CA6B);
    h ^= h >> 13;
    h = h.wrapping_mul(0xC2B2_AE35);
    h ^= h >> 16;
    h
}
