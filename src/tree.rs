//! Tree and commit objects — encoding, canonical ordering, and the
//! chunk-tree builder for hashsplit files.
//!
//! # Tree payload (frozen binary layout)
//!
//! ```text
//! entry := "<octal-mode> <name>\0" || id (20 raw bytes)
//! tree  := entry*          (entries in canonical name order)
//! ```
//!
//! Modes are octal ASCII without leading zeros (`100644`, `40000`, …).
//! Canonical order compares names byte-lexicographically with directory
//! names treated as if suffixed by `/`, so `foo` sorts before `foo.bar`
//! while `foo/` contents keep their relative place. The same name never
//! appears twice in one tree. This layout is mandatory for binary
//! compatibility; the empty tree hashes to
//! `4b825dc642cb6eb9a060e54bf8d69288fbee4904`.
//!
//! # Chunk trees
//!
//! A hashsplit file is stored as a balanced tree over its blob sequence.
//! [`ChunkTreeBuilder`] consumes `(id, size, level)` in stream order: a
//! level-`L` boundary closes `L` layers, each closed layer becoming a tree
//! object whose entries are named by the 16-hex-digit end offset of the
//! span they cover. Single-blob files collapse to the bare blob.

use chrono::{DateTime, Utc};

use crate::errors::{Error, Result};
use crate::oid::{Kind, ObjectId, ID_LEN};

// ── Modes ────────────────────────────────────────────────────────────────────

pub const MODE_FILE:    u32 = 0o100644;
pub const MODE_EXEC:    u32 = 0o100755;
pub const MODE_SYMLINK: u32 = 0o120000;
pub const MODE_DIR:     u32 = 0o040000;

/// Is this mode a tree reference?
#[inline]
pub fn mode_is_dir(mode: u32) -> bool {
    mode & 0o170000 == 0o040000
}

// ── Tree entries ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: Vec<u8>,
    pub id:   ObjectId,
}

impl TreeEntry {
    /// The byte string this entry sorts by: directories compare as if the
    /// name ended in `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.clone();
        if mode_is_dir(self.mode) {
            key.push(b'/');
        }
        key
    }
}

/// Sort entries into canonical order.
pub fn canonical_sort(entries: &mut [TreeEntry]) {
    entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Encode a canonical tree payload. Entries must already be sorted; this is
/// checked in debug builds.
pub fn encode_tree(entries: &[TreeEntry]) -> Vec<u8> {
    debug_assert!(
        entries.windows(2).all(|w| w[0].sort_key() < w[1].sort_key()),
        "tree entries not in canonical order or name repeated"
    );
    let mut out = Vec::with_capacity(entries.iter().map(|e| e.name.len() + 28).sum());
    for e in entries {
        out.extend_from_slice(format!("{:o} ", e.mode).as_bytes());
        out.extend_from_slice(&e.name);
        out.push(0);
        out.extend_from_slice(e.id.as_bytes());
    }
    out
}

/// Decode a tree payload back into entries.
pub fn decode_tree(bytes: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let sp = bytes[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::corrupt("tree", "missing mode terminator"))?;
        let mode_str = std::str::from_utf8(&bytes[pos..pos + sp])
            .map_err(|_| Error::corrupt("tree", "non-ASCII mode"))?;
        let mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| Error::corrupt("tree", format!("bad mode {mode_str:?}")))?;
        pos += sp + 1;

        let nul = bytes[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::corrupt("tree", "missing name terminator"))?;
        let name = bytes[pos..pos + nul].to_vec();
        pos += nul + 1;

        if pos + ID_LEN > bytes.len() {
            return Err(Error::corrupt("tree", "truncated entry id"));
        }
        let id = ObjectId::from_bytes(bytes[pos..pos + ID_LEN].try_into().unwrap());
        pos += ID_LEN;

        entries.push(TreeEntry { mode, name, id });
    }
    Ok(entries)
}

// ── Commits ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub tree:    ObjectId,
    pub parents: Vec<ObjectId>,
    pub author:  String,
    pub email:   String,
    pub when:    DateTime<Utc>,
    pub message: String,
}

/// Encode the textual commit payload.
pub fn encode_commit(c: &CommitInfo) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("tree {}\n", c.tree).as_bytes());
    for p in &c.parents {
        out.extend_from_slice(format!("parent {p}\n").as_bytes());
    }
    let sig = format!("{} <{}> {} +0000", c.author, c.email, c.when.timestamp());
    out.extend_from_slice(format!("author {sig}\n").as_bytes());
    out.extend_from_slice(format!("committer {sig}\n").as_bytes());
    out.push(b'\n');
    out.extend_from_slice(c.message.as_bytes());
    out
}

/// Extract the tree and parent IDs from a commit payload (read side of the
/// ref-rebase path and of graph-closure checks).
pub fn parse_commit_refs(bytes: &[u8]) -> Result<(ObjectId, Vec<ObjectId>)> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::corrupt("commit", "payload is not UTF-8"))?;
    let mut tree = None;
    let mut parents = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            break; // header/message separator
        }
        if let Some(hex) = line.strip_prefix("tree ") {
            tree = Some(ObjectId::from_hex(hex)?);
        } else if let Some(hex) = line.strip_prefix("parent ") {
            parents.push(ObjectId::from_hex(hex)?);
        }
    }
    let tree = tree.ok_or_else(|| Error::corrupt("commit", "missing tree header"))?;
    Ok((tree, parents))
}

// ── Chunk-tree builder ───────────────────────────────────────────────────────

/// One pending child within a chunk-tree layer.
struct Span {
    mode:    u32,
    id:      ObjectId,
    /// End offset of the bytes this child covers, relative to file start.
    end_ofs: u64,
}

/// Assembles the balanced tree over a file's blob sequence.
///
/// `push` once per blob in stream order with the boundary level the
/// splitter reported; `finish` returns `(mode, id)` for the file's root —
/// the blob itself when the file fit in one chunk, otherwise a tree.
pub struct ChunkTreeBuilder {
    file_mode: u32,
    layers:    Vec<Vec<Span>>,
    offset:    u64,
}

impl ChunkTreeBuilder {
    pub fn new(file_mode: u32) -> Self {
        ChunkTreeBuilder { file_mode, layers: vec![Vec::new()], offset: 0 }
    }

    pub fn push<F>(&mut self, id: ObjectId, size: u64, level: u32, write: &mut F) -> Result<()>
    where
        F: FnMut(Kind, &[u8]) -> Result<ObjectId>,
    {
        self.offset += size;
        self.layers[0].push(Span { mode: self.file_mode, id, end_ofs: self.offset });
        if level > 0 {
            self.squish(level as usize, write)?;
        }
        Ok(())
    }

    /// Close every open layer and return `(mode, id)` of the file root.
    /// A file that never grew past one blob keeps its blob identity and
    /// file mode; anything wrapped reports tree mode.
    pub fn finish<F>(mut self, write: &mut F) -> Result<(u32, ObjectId)>
    where
        F: FnMut(Kind, &[u8]) -> Result<ObjectId>,
    {
        let depth = self.layers.len();
        self.squish(depth, write)?;
        let root = self.layers.last_mut().unwrap().pop().unwrap();
        Ok((root.mode, root.id))
    }

    /// Close layers `0..depth` bottom-up, each closed layer becoming a
    /// tree entry one layer up. A layer holding a single span is hoisted
    /// instead of wrapped, so a run of quiet boundaries cannot produce
    /// chains of one-child trees; the span's own mode travels with it, and
    /// only real merges mint tree objects.
    fn squish<F>(&mut self, depth: usize, write: &mut F) -> Result<()>
    where
        F: FnMut(Kind, &[u8]) -> Result<ObjectId>,
    {
        for layer in 0..depth {
            if layer >= self.layers.len() {
                break;
            }
            if self.layers[layer].is_empty() {
                continue;
            }
            if self.layers.len() == layer + 1 {
                self.layers.push(Vec::new());
            }
            if self.layers[layer].len() == 1 {
                let span = self.layers[layer].pop().unwrap();
                self.layers[layer + 1].push(span);
                continue;
            }
            let spans = std::mem::take(&mut self.layers[layer]);
            let end_ofs = spans.last().unwrap().end_ofs;
            let entries: Vec<TreeEntry> = spans
                .iter()
                .map(|s| TreeEntry {
                    mode: s.mode,
                    name: format!("{:016x}", s.end_ofs).into_bytes(),
                    id:   s.id,
                })
                .collect();
            // Offset names are fixed-width hex and none is a directory
            // suffix of another, so stream order is already canonical.
            let id = write(Kind::Tree, &encode_tree(&entries))?;
            self.layers[layer + 1].push(Span { mode: MODE_DIR, id, end_ofs });
        }
        Ok(())
    }
}
