//! Object identity — 160-bit content IDs with a typed header.
//!
//! The ID of an object is the SHA-1 digest of the textual header
//! `"<type> <decimal-length>\0"` followed by the payload. The digest
//! function is frozen: IDs are the only cross-object reference and the
//! on-disk formats (idx fanout, pack names, Bloom slices) all consume the
//! raw 20 bytes. Substituting a different hash breaks every existing
//! repository.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::errors::{Error, Result};

/// Raw byte length of an object ID.
pub const ID_LEN: usize = 20;

// ── Object kind ──────────────────────────────────────────────────────────────

/// The three object types in the graph.
///
/// The numeric tag is stored in the high 3 bits of the idx CRC field so
/// that an encrypted repository can be restored from its idxes alone,
/// without reading pack contents. Tag 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Blob,
    Tree,
    Commit,
}

impl Kind {
    /// The header name written in front of the payload before hashing.
    pub fn header_name(self) -> &'static str {
        match self {
            Kind::Blob   => "blob",
            Kind::Tree   => "tree",
            Kind::Commit => "commit",
        }
    }

    /// 3-bit type tag carried in the idx CRC field.
    pub fn tag(self) -> u32 {
        match self {
            Kind::Blob   => 1,
            Kind::Tree   => 2,
            Kind::Commit => 3,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Kind::Blob),
            2 => Some(Kind::Tree),
            3 => Some(Kind::Commit),
            _ => None,
        }
    }
}

// ── ObjectId ─────────────────────────────────────────────────────────────────

/// A 20-byte content address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; ID_LEN]);

impl ObjectId {
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        ObjectId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// First byte, used for idx fanout bucketing.
    #[inline]
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| Error::Input {
            path: s.into(),
            reason: format!("bad object id: {e}"),
        })?;
        let bytes: [u8; ID_LEN] = raw.as_slice().try_into().map_err(|_| Error::Input {
            path: s.into(),
            reason: format!("bad object id length {}", raw.len()),
        })?;
        Ok(ObjectId(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

/// Compute the content ID of a `(kind, payload)` pair.
pub fn id_for(kind: Kind, payload: &[u8]) -> ObjectId {
    let mut h = Sha1::new();
    h.update(kind.header_name().as_bytes());
    h.update(b" ");
    h.update(payload.len().to_string().as_bytes());
    h.update(b"\0");
    h.update(payload);
    ObjectId(h.finalize().into())
}

/// SHA-1 over arbitrary bytes (pack trailers, idx digests, pack names).
pub fn sha1(bytes: &[u8]) -> [u8; ID_LEN] {
    let mut h = Sha1::new();
    h.update(bytes);
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_id_matches_known_value() {
        // sha1("blob 0\0") — the well-known empty-blob address.
        let id = id_for(Kind::Blob, b"");
        assert_eq!(id.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn empty_tree_id_matches_known_value() {
        let id = id_for(Kind::Tree, b"");
        assert_eq!(id.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn hex_roundtrip() {
        let id = id_for(Kind::Blob, b"hello");
        assert_eq!(ObjectId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn kind_tags_roundtrip() {
        for kind in [Kind::Blob, Kind::Tree, Kind::Commit] {
            assert_eq!(Kind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(Kind::from_tag(0), None);
        assert_eq!(Kind::from_tag(7), None);
    }
}
