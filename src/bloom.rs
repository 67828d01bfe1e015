//! Bloom filter over object IDs.
//!
//! The k hash functions are disjoint 32-bit big-endian slices of the ID
//! itself — an ID is already a uniform digest, so no rehashing is needed
//! and membership checks touch no hash state. A 20-byte ID yields five
//! slices, fixing `k = 5`.
//!
//! Sizing: the bit count is the next power of two covering 16 bits per
//! expected entry. At the midx's 2·N provisioning that keeps the false
//! positive rate comfortably under 1% (at `m/n = 16`, `k = 5` the rate is
//! ≈0.14%); a filter loaded beyond its design capacity degrades gradually
//! rather than failing.

use byteorder::{BigEndian, ByteOrder};

use crate::errors::{Error, Result};
use crate::oid::ObjectId;

/// Hash count: one per disjoint 32-bit slice of a 20-byte ID.
pub const BLOOM_K: usize = 5;

/// Target bits per expected entry.
const BITS_PER_ENTRY: u64 = 16;

/// Smallest filter: 2^10 bits, so toy repositories stay sane.
const MIN_BITS: u64 = 1 << 10;

pub struct Bloom {
    bits: Vec<u8>,
    /// Bit-index mask; bit count is always a power of two.
    mask: u32,
}

impl Bloom {
    /// Build an empty filter sized for `expected` entries.
    pub fn with_capacity(expected: usize) -> Self {
        let want = (expected as u64 * BITS_PER_ENTRY).max(MIN_BITS);
        let m = want.next_power_of_two().min(1 << 31);
        Bloom { bits: vec![0u8; (m / 8) as usize], mask: (m - 1) as u32 }
    }

    fn slots(&self, id: &ObjectId) -> [u32; BLOOM_K] {
        let raw = id.as_bytes();
        let mut out = [0u32; BLOOM_K];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = BigEndian::read_u32(&raw[i * 4..i * 4 + 4]) & self.mask;
        }
        out
    }

    pub fn insert(&mut self, id: &ObjectId) {
        for bit in self.slots(id) {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// May return a false positive; never a false negative.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.slots(id)
            .iter()
            .all(|&bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Reconstruct from stored bytes. The length must be a power of two.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let bit_count = bytes.len() as u64 * 8;
        if bit_count < 8 || !bit_count.is_power_of_two() {
            return Err(Error::corrupt("bloom", format!("bad filter size {} bytes", bytes.len())));
        }
        Ok(Bloom { mask: (bit_count - 1) as u32, bits: bytes })
    }
}
