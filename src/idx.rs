//! Pack index (idx) v2 — sorted map from object ID to pack offset.
//!
//! # On-disk layout (all integers big-endian)
//!
//! ```text
//! Offset    Size   Field
//!    0        4    magic        = \377 't' 'O' 'c'
//!    4        4    version      = 2
//!    8     1024    fanout[256]  fanout[b] = count of IDs with first byte <= b
//! 1032     N*20    ids          sorted ascending, N = fanout[255]
//!  ...     N*4     crcs         CRC-32 of the pack record; high 3 bits = type tag
//!  ...     N*4     offsets      31-bit pack offsets; MSB set = index into large table
//!  ...     L*8     large offsets (only entries >= 2^31)
//!  ...       20    pack digest  (copied from the .pack trailer)
//!  ...       20    idx digest   SHA-1 of everything above
//! ```
//!
//! The type tag in the CRC's high bits lets an encrypted repository be
//! restored from idxes alone, without reading pack contents. CRC coverage
//! is the full on-disk record (length prefix + compressed bytes).
//!
//! Lookup uses `fanout[first_byte - 1]..fanout[first_byte]` to bound a
//! binary search: one L1-resident table probe plus log2(bucket) compares.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::errors::{Error, Result};
use crate::oid::{sha1, Kind, ObjectId, ID_LEN};

pub const IDX_MAGIC:   [u8; 4] = [0xff, b't', b'O', b'c'];
pub const IDX_VERSION: u32     = 2;

/// Offset table sentinel bit: the low 31 bits index the large-offset table.
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// Mask for the CRC payload once the 3-bit type tag is removed.
const CRC_MASK: u32 = 0x1FFF_FFFF;

/// One object's row, as recorded by the pack writer.
#[derive(Debug, Clone)]
pub struct IdxEntry {
    pub id:     ObjectId,
    pub crc:    u32,
    pub kind:   Kind,
    pub offset: u64,
}

/// Serialize an idx for one pack. `entries` must be sorted by ID with no
/// duplicates (the pack writer's table is deduplicated by construction).
pub fn encode(entries: &[IdxEntry], pack_digest: &[u8; ID_LEN]) -> Vec<u8> {
    debug_assert!(entries.windows(2).all(|w| w[0].id < w[1].id));

    let mut out = Vec::with_capacity(8 + 1024 + entries.len() * (ID_LEN + 8) + 48);
    out.extend_from_slice(&IDX_MAGIC);
    out.write_u32::<BigEndian>(IDX_VERSION).unwrap();

    // Fanout: cumulative counts per leading byte.
    let mut fanout = [0u32; 256];
    for e in entries {
        fanout[e.id.first_byte() as usize] += 1;
    }
    let mut running = 0u32;
    for bucket in fanout.iter_mut() {
        running += *bucket;
        *bucket = running;
    }
    for count in fanout {
        out.write_u32::<BigEndian>(count).unwrap();
    }

    for e in entries {
        out.extend_from_slice(e.id.as_bytes());
    }
    for e in entries {
        out.write_u32::<BigEndian>((e.kind.tag() << 29) | (e.crc & CRC_MASK))
            .unwrap();
    }

    // 31-bit offsets with spill table for >= 2^31.
    let mut large = Vec::new();
    for e in entries {
        if e.offset < LARGE_OFFSET_FLAG as u64 {
            out.write_u32::<BigEndian>(e.offset as u32).unwrap();
        } else {
            out.write_u32::<BigEndian>(LARGE_OFFSET_FLAG | large.len() as u32)
                .unwrap();
            large.push(e.offset);
        }
    }
    for ofs in large {
        out.write_u64::<BigEndian>(ofs).unwrap();
    }

    out.extend_from_slice(pack_digest);
    let digest = sha1(&out);
    out.extend_from_slice(&digest);
    out
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// A parsed idx held in memory.
#[derive(Debug)]
pub struct PackIdx {
    /// File name this idx was loaded from, for error reporting and midx
    /// coverage tracking.
    pub name:        String,
    fanout:          [u32; 256],
    ids:             Vec<ObjectId>,
    crcs:            Vec<u32>,
    offsets:         Vec<u32>,
    large_offsets:   Vec<u64>,
    pub pack_digest: [u8; ID_LEN],
}

impl PackIdx {
    /// Parse and validate an idx file. The trailing digest is verified
    /// first; any mismatch is corruption and the caller quarantines the
    /// file.
    pub fn parse(name: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 + 1024 + 2 * ID_LEN {
            return Err(Error::corrupt(name, "idx too short"));
        }

        let (body, stored_digest) = bytes.split_at(bytes.len() - ID_LEN);
        if sha1(body) != *stored_digest {
            return Err(Error::corrupt(name, "idx digest mismatch"));
        }

        if bytes[0..4] != IDX_MAGIC {
            return Err(Error::corrupt(name, "bad idx magic"));
        }
        let version = BigEndian::read_u32(&bytes[4..8]);
        if version != IDX_VERSION {
            return Err(Error::corrupt(name, format!("unsupported idx version {version}")));
        }

        let mut fanout = [0u32; 256];
        for (b, slot) in fanout.iter_mut().enumerate() {
            *slot = BigEndian::read_u32(&bytes[8 + b * 4..]);
        }
        if fanout.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::corrupt(name, "idx fanout not monotonic"));
        }
        let n = fanout[255] as usize;

        let ids_start = 8 + 1024;
        let crcs_start = ids_start + n * ID_LEN;
        let offsets_start = crcs_start + n * 4;
        let large_start = offsets_start + n * 4;
        if body.len() < large_start + ID_LEN {
            return Err(Error::corrupt(name, "idx truncated"));
        }

        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let raw: [u8; ID_LEN] = bytes[ids_start + i * ID_LEN..ids_start + (i + 1) * ID_LEN]
                .try_into()
                .unwrap();
            ids.push(ObjectId::from_bytes(raw));
        }
        if ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::corrupt(name, "idx ids not strictly sorted"));
        }

        let mut crcs = Vec::with_capacity(n);
        for i in 0..n {
            crcs.push(BigEndian::read_u32(&bytes[crcs_start + i * 4..]));
        }
        let mut offsets = Vec::with_capacity(n);
        for i in 0..n {
            offsets.push(BigEndian::read_u32(&bytes[offsets_start + i * 4..]));
        }

        let large_count = (body.len() - large_start - ID_LEN) / 8;
        let mut large_offsets = Vec::with_capacity(large_count);
        for i in 0..large_count {
            large_offsets.push(BigEndian::read_u64(&bytes[large_start + i * 8..]));
        }

        let pack_digest: [u8; ID_LEN] = body[body.len() - ID_LEN..].try_into().unwrap();

        Ok(PackIdx { name: name.to_owned(), fanout, ids, crcs, offsets, large_offsets, pack_digest })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[ObjectId] {
        &self.ids
    }

    /// Row index of `id`, via fanout-bounded binary search.
    fn position(&self, id: &ObjectId) -> Option<usize> {
        let b = id.first_byte() as usize;
        let lo = if b == 0 { 0 } else { self.fanout[b - 1] as usize };
        let hi = self.fanout[b] as usize;
        self.ids[lo..hi]
            .binary_search(id)
            .ok()
            .map(|i| lo + i)
    }

    /// Byte offset of the object's record within the pack.
    pub fn find(&self, id: &ObjectId) -> Option<u64> {
        self.position(id).map(|i| {
            let raw = self.offsets[i];
            if raw & LARGE_OFFSET_FLAG == 0 {
                raw as u64
            } else {
                self.large_offsets[(raw & !LARGE_OFFSET_FLAG) as usize]
            }
        })
    }

    /// Object type recovered from the CRC field's tag bits.
    pub fn kind_of(&self, id: &ObjectId) -> Option<Kind> {
        self.position(id).and_then(|i| Kind::from_tag(self.crcs[i] >> 29))
    }

    /// Stored CRC-32 of the pack record (tag bits stripped).
    pub fn crc_of(&self, id: &ObjectId) -> Option<u32> {
        self.position(id).map(|i| self.crcs[i] & CRC_MASK)
    }
}
