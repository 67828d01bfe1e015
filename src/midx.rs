//! Multi-pack index (midx) — one sorted lookup over many idxes.
//!
//! # On-disk layout (all integers big-endian)
//!
//! ```text
//! Offset  Size    Field
//!    0      4     magic      = "MIDX"
//!    4      4     version    = 1
//!    8      4     bloom_len  filter bytes (power of two)
//!   12      4     idx_count
//!   16      4     id_count   N
//!   20      B     bloom filter bits
//!  ...      *     idx names: per idx, u16 length + bytes
//!  ...   1024     fanout[256]
//!  ...   N*20     ids        sorted ascending, duplicates collapsed
//!  ...    N*4     sources    ordinal into the idx-name table per ID
//!  ...     20     digest     SHA-1 of everything above
//! ```
//!
//! A midx is derived data: it covers a snapshot of idx files and goes
//! stale when those are deleted. Staleness is detected at load time by the
//! caller (a covered idx no longer listed) and the midx is skipped; a
//! digest mismatch is corruption and quarantines the file. The facade is
//! correct with zero midxes — it just opens more idxes.
//!
//! Lookup answers "which idx holds this ID", so a hit opens exactly one
//! idx and a Bloom miss opens none.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use tracing::debug;

use crate::bloom::Bloom;
use crate::errors::{Error, Result};
use crate::idx::PackIdx;
use crate::oid::{sha1, ObjectId, ID_LEN};

pub const MIDX_MAGIC:   &[u8; 4] = b"MIDX";
pub const MIDX_VERSION: u32      = 1;

/// Merge idxes into a serialized midx. Returns `(file_name, bytes)`; the
/// name is content-addressed over the merged ID array.
pub fn encode(idxes: &[&PackIdx]) -> (String, Vec<u8>) {
    // K-way merge by repeated minimum; idx ID arrays are already sorted.
    // Duplicates across idxes collapse to the first source, matching the
    // at-most-one-pack invariant for fresh repositories and remaining
    // harmless where history predates it.
    let total: usize = idxes.iter().map(|i| i.len()).sum();
    let mut merged: Vec<(ObjectId, u32)> = Vec::with_capacity(total);
    let mut cursors = vec![0usize; idxes.len()];
    loop {
        let mut best: Option<(ObjectId, usize)> = None;
        for (ord, idx) in idxes.iter().enumerate() {
            if cursors[ord] < idx.len() {
                let id = idx.ids()[cursors[ord]];
                if best.map_or(true, |(b, _)| id < b) {
                    best = Some((id, ord));
                }
            }
        }
        let Some((id, ord)) = best else { break };
        cursors[ord] += 1;
        match merged.last() {
            Some(&(last, _)) if last == id => {} // duplicate, keep first
            _ => merged.push((id, ord as u32)),
        }
    }

    let mut bloom = Bloom::with_capacity(merged.len() * 2);
    for (id, _) in &merged {
        bloom.insert(id);
    }

    let mut fanout = [0u32; 256];
    for (id, _) in &merged {
        fanout[id.first_byte() as usize] += 1;
    }
    let mut running = 0u32;
    for bucket in fanout.iter_mut() {
        running += *bucket;
        *bucket = running;
    }

    let mut out = Vec::new();
    out.extend_from_slice(MIDX_MAGIC);
    out.write_u32::<BigEndian>(MIDX_VERSION).unwrap();
    out.write_u32::<BigEndian>(bloom.byte_len() as u32).unwrap();
    out.write_u32::<BigEndian>(idxes.len() as u32).unwrap();
    out.write_u32::<BigEndian>(merged.len() as u32).unwrap();
    out.extend_from_slice(bloom.as_bytes());
    for idx in idxes {
        out.write_u16::<BigEndian>(idx.name.len() as u16).unwrap();
        out.extend_from_slice(idx.name.as_bytes());
    }
    for count in fanout {
        out.write_u32::<BigEndian>(count).unwrap();
    }
    for (id, _) in &merged {
        out.extend_from_slice(id.as_bytes());
    }
    for (_, ord) in &merged {
        out.write_u32::<BigEndian>(*ord).unwrap();
    }

    let mut id_bytes = Vec::with_capacity(merged.len() * ID_LEN);
    for (id, _) in &merged {
        id_bytes.extend_from_slice(id.as_bytes());
    }
    let name = format!("midx-{}.midx", hex::encode(sha1(&id_bytes)));

    let digest = sha1(&out);
    out.extend_from_slice(&digest);
    debug!(name = %name, ids = merged.len(), idxes = idxes.len(), "built midx");
    (name, out)
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct Midx {
    pub name:      String,
    /// Idx file names this midx covers, in source-ordinal order.
    pub idx_names: Vec<String>,
    bloom:         Bloom,
    fanout:        [u32; 256],
    ids:           Vec<ObjectId>,
    sources:       Vec<u32>,
}

impl Midx {
    pub fn parse(name: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 20 + 1024 + ID_LEN {
            return Err(Error::corrupt(name, "midx too short"));
        }
        let (body, stored_digest) = bytes.split_at(bytes.len() - ID_LEN);
        if sha1(body) != *stored_digest {
            return Err(Error::corrupt(name, "midx digest mismatch"));
        }
        if &bytes[0..4] != MIDX_MAGIC {
            return Err(Error::corrupt(name, "bad midx magic"));
        }
        let version = BigEndian::read_u32(&bytes[4..8]);
        if version != MIDX_VERSION {
            return Err(Error::corrupt(name, format!("unsupported midx version {version}")));
        }

        let bloom_len = BigEndian::read_u32(&bytes[8..12]) as usize;
        let idx_count = BigEndian::read_u32(&bytes[12..16]) as usize;
        let id_count = BigEndian::read_u32(&bytes[16..20]) as usize;

        let mut pos = 20;
        let overrun = || Error::corrupt(name, "midx truncated");
        if body.len() < pos + bloom_len {
            return Err(overrun());
        }
        let bloom = Bloom::from_bytes(bytes[pos..pos + bloom_len].to_vec())
            .map_err(|_| Error::corrupt(name, "bad bloom size"))?;
        pos += bloom_len;

        let mut idx_names = Vec::with_capacity(idx_count);
        for _ in 0..idx_count {
            if body.len() < pos + 2 {
                return Err(overrun());
            }
            let len = BigEndian::read_u16(&bytes[pos..pos + 2]) as usize;
            pos += 2;
            if body.len() < pos + len {
                return Err(overrun());
            }
            let idx_name = std::str::from_utf8(&bytes[pos..pos + len])
                .map_err(|_| Error::corrupt(name, "idx name not UTF-8"))?;
            idx_names.push(idx_name.to_owned());
            pos += len;
        }

        if body.len() < pos + 1024 + id_count * (ID_LEN + 4) {
            return Err(overrun());
        }
        let mut fanout = [0u32; 256];
        for (b, slot) in fanout.iter_mut().enumerate() {
            *slot = BigEndian::read_u32(&bytes[pos + b * 4..]);
        }
        pos += 1024;
        if fanout.windows(2).any(|w| w[0] > w[1]) || fanout[255] as usize != id_count {
            return Err(Error::corrupt(name, "midx fanout inconsistent"));
        }

        let mut ids = Vec::with_capacity(id_count);
        for i in 0..id_count {
            let raw: [u8; ID_LEN] = bytes[pos + i * ID_LEN..pos + (i + 1) * ID_LEN]
                .try_into()
                .unwrap();
            ids.push(ObjectId::from_bytes(raw));
        }
        pos += id_count * ID_LEN;

        let mut sources = Vec::with_capacity(id_count);
        for i in 0..id_count {
            let ord = BigEndian::read_u32(&bytes[pos + i * 4..]);
            if ord as usize >= idx_count {
                return Err(Error::corrupt(name, "midx source ordinal out of range"));
            }
            sources.push(ord);
        }

        Ok(Midx { name: name.to_owned(), idx_names, bloom, fanout, ids, sources })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Which covered idx holds `id`, if any. The Bloom filter screens out
    /// most absent IDs without touching the sorted array.
    pub fn find(&self, id: &ObjectId) -> Option<&str> {
        if !self.bloom.contains(id) {
            return None;
        }
        let b = id.first_byte() as usize;
        let lo = if b == 0 { 0 } else { self.fanout[b - 1] as usize };
        let hi = self.fanout[b] as usize;
        self.ids[lo..hi]
            .binary_search(id)
            .ok()
            .map(|i| self.idx_names[self.sources[lo + i] as usize].as_str())
    }
}
