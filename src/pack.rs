//! Pack writer — append-only files of compressed, typed objects.
//!
//! # On-disk layout
//!
//! ```text
//! header  := "PACK" || version=2 (u32 BE) || object_count (u32 BE)
//! record  := comp_len (u32 BE) || zlib(payload)
//! trailer := SHA-1 over everything before it
//! ```
//!
//! The writer owns a temp file (`tmp-<uuid>.pack`) for its whole lifetime;
//! readers never see it. `object_count` is written as zero at open and
//! patched at close, after which the trailer is computed over the patched
//! file so the digest always matches the durable bytes. The finalized file
//! is content-addressed: `pack-<hex>` where `<hex>` is the SHA-1 of the
//! pack's sorted object IDs — the name depends on what is stored, not the
//! order it arrived in.
//!
//! Object types are not written into records. They live in the idx CRC
//! tag bits, which is what makes idx-only restore possible for encrypted
//! repositories.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use tracing::debug;
use uuid::Uuid;

use crate::errors::Result;
use crate::idx::{self, IdxEntry};
use crate::oid::{sha1, Kind, ObjectId, ID_LEN};

pub const PACK_MAGIC:   &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32      = 2;

/// Map a configured zlib level to flate2's scale. `-1` means the library
/// default; `0..=9` are explicit levels.
pub fn compression_for(level: i32) -> Compression {
    if (0..=9).contains(&level) {
        Compression::new(level as u32)
    } else {
        Compression::default()
    }
}

/// A closed pack, ready for durable storage. `tmp_path` still holds the
/// bytes; the sink renames or uploads it under `name`.
pub struct FinishedPack {
    /// Canonical stem, e.g. `pack-3f2a…` (no extension).
    pub name:        String,
    pub tmp_path:    PathBuf,
    pub pack_digest: [u8; ID_LEN],
    /// Idx rows sorted by ID.
    pub entries:     Vec<IdxEntry>,
    /// Serialized idx, digest-sealed.
    pub idx_bytes:   Vec<u8>,
    pub pack_len:    u64,
}

/// Writer for one open pack.
pub struct PackWriter {
    file:     File,
    tmp_path: PathBuf,
    level:    Compression,
    written:  u64,
    records:  Vec<IdxEntry>,
    seen:     HashSet<ObjectId>,
}

impl PackWriter {
    /// Create a temp pack in `dir` and write the zero-count header.
    pub fn create(dir: &Path, zlib_level: i32) -> Result<Self> {
        let tmp_path = dir.join(format!("tmp-{}.pack", Uuid::new_v4()));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(PACK_MAGIC)?;
        file.write_u32::<BigEndian>(PACK_VERSION)?;
        file.write_u32::<BigEndian>(0)?; // patched at close
        debug!(path = %tmp_path.display(), "opened pack");
        Ok(PackWriter {
            file,
            tmp_path,
            level: compression_for(zlib_level),
            written: 12,
            records: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// Bytes written so far (header + records).
    pub fn size(&self) -> u64 {
        self.written
    }

    pub fn object_count(&self) -> usize {
        self.records.len()
    }

    /// Does this writer's in-memory table already hold `id`? The store
    /// consults this for not-yet-finalized packs.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.seen.contains(id)
    }

    /// Append one object. The caller has already established the ID is new
    /// repository-wide (dedup happens at the admission point, not here).
    pub fn add(&mut self, kind: Kind, id: ObjectId, payload: &[u8]) -> Result<()> {
        let offset = self.written;

        let mut enc = ZlibEncoder::new(Vec::new(), self.level);
        enc.write_all(payload)?;
        let compressed = enc.finish()?;

        let mut record = Vec::with_capacity(4 + compressed.len());
        record.write_u32::<BigEndian>(compressed.len() as u32)?;
        record.extend_from_slice(&compressed);

        let mut crc = crc32fast::Hasher::new();
        crc.update(&record);

        self.file.write_all(&record)?;
        self.written += record.len() as u64;
        self.records.push(IdxEntry { id, crc: crc.finalize(), kind, offset });
        self.seen.insert(id);
        Ok(())
    }

    /// Patch the object count, append the trailer, fsync, and build the
    /// companion idx. The temp file is left in place for the sink.
    pub fn close(mut self) -> Result<FinishedPack> {
        self.file.seek(SeekFrom::Start(8))?;
        self.file
            .write_u32::<BigEndian>(self.records.len() as u32)?;

        // Digest the patched file from the start.
        self.file.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = self.file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let pack_digest: [u8; ID_LEN] = hasher.finalize().into();

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&pack_digest)?;
        self.file.sync_all()?;
        let pack_len = self.written + ID_LEN as u64;

        // Content address: SHA-1 of the sorted ID array.
        let mut entries = self.records;
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let mut id_bytes = Vec::with_capacity(entries.len() * ID_LEN);
        for e in &entries {
            id_bytes.extend_from_slice(e.id.as_bytes());
        }
        let name = format!("pack-{}", hex::encode(sha1(&id_bytes)));

        let idx_bytes = idx::encode(&entries, &pack_digest);
        debug!(
            name = %name,
            objects = entries.len(),
            bytes = pack_len,
            "closed pack"
        );

        Ok(FinishedPack { name, tmp_path: self.tmp_path, pack_digest, entries, idx_bytes, pack_len })
    }

    /// Abort: unlink the temp file. Nothing durable was touched.
    pub fn abort(self) -> Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.tmp_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idx::PackIdx;
    use crate::oid::id_for;
    use byteorder::ByteOrder;
    use flate2::read::ZlibDecoder;

    fn write_objects(dir: &Path, payloads: &[&[u8]]) -> FinishedPack {
        let mut w = PackWriter::create(dir, 1).unwrap();
        for p in payloads {
            let id = id_for(Kind::Blob, p);
            w.add(Kind::Blob, id, p).unwrap();
        }
        w.close().unwrap()
    }

    #[test]
    fn pack_layout_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let finished = write_objects(dir.path(), &[b"alpha", b"beta", b"gamma"]);

        let bytes = std::fs::read(&finished.tmp_path).unwrap();
        assert_eq!(&bytes[0..4], PACK_MAGIC);
        assert_eq!(byteorder::BigEndian::read_u32(&bytes[4..8]), PACK_VERSION);
        assert_eq!(byteorder::BigEndian::read_u32(&bytes[8..12]), 3);

        // Trailer covers everything before it, post count-patch.
        let (body, trailer) = bytes.split_at(bytes.len() - ID_LEN);
        assert_eq!(sha1(body), *trailer);
        assert_eq!(finished.pack_digest, *trailer);
    }

    #[test]
    fn records_decompress_via_idx_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let payloads: [&[u8]; 2] = [b"hello pack", b"other object"];
        let finished = write_objects(dir.path(), &payloads);
        let bytes = std::fs::read(&finished.tmp_path).unwrap();
        let idx = PackIdx::parse("t.idx", &finished.idx_bytes).unwrap();

        for p in payloads {
            let id = id_for(Kind::Blob, p);
            let ofs = idx.find(&id).unwrap() as usize;
            let comp_len = byteorder::BigEndian::read_u32(&bytes[ofs..ofs + 4]) as usize;
            let mut out = Vec::new();
            ZlibDecoder::new(&bytes[ofs + 4..ofs + 4 + comp_len])
                .read_to_end(&mut out)
                .unwrap();
            assert_eq!(out, p);
            assert_eq!(idx.kind_of(&id), Some(Kind::Blob));
        }
    }

    #[test]
    fn name_depends_on_ids_not_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_objects(dir.path(), &[b"one", b"two"]);
        let b = write_objects(dir.path(), &[b"two", b"one"]);
        assert_eq!(a.name, b.name);
        assert!(a.name.starts_with("pack-"));
    }

    #[test]
    fn abort_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let w = PackWriter::create(dir.path(), 1).unwrap();
        let path = w.tmp_path.clone();
        assert!(path.exists());
        w.abort().unwrap();
        assert!(!path.exists());
    }
}
