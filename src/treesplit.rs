//! Directory tree-split — hashsplit applied to sorted directory listings.
//!
//! A directory with hundreds of thousands of entries must not become one
//! huge tree object. With `treesplit` enabled, the canonical entry list is
//! cut into groups by a rolling boundary over the entry names; each group
//! becomes a subtree, and the grouping is re-applied to each layer of
//! subtree names until a layer fits in one tree. Subtrees are named by the
//! shortest prefixes of their first entry's name that stay distinct across
//! the layer (`000/0001/…`), so readers can still binary-search by name.
//!
//! Every **leaf** subtree carries its own `.bupm` metadata blob covering
//! exactly its slice of entries; intermediate prefix trees carry none. The
//! root tree carries a `<depth>.bupd` marker blob telling readers how many
//! indirection layers to expect.
//!
//! A split directory and an unsplit directory with the same entries are
//! structurally different objects with different IDs, but enumerate the
//! same `(name, mode, id)` set when walked.
//!
//! The boundary chooser is a trait so the tree builder can be driven by a
//! deterministic splitter in tests; production uses the rolling checksum
//! with [`DIR_SPLIT_BITS`].

use crate::errors::{Error, Result};
use crate::oid::ObjectId;
use crate::rollsum::Rollsum;
use crate::tree::{canonical_sort, encode_tree, mode_is_dir, TreeEntry, MODE_DIR, MODE_FILE};

/// Boundary significance for directory splitting: ~64-entry expected
/// groups. Not configurable.
pub const DIR_SPLIT_BITS: u32 = 6;

/// Metadata companion file name. Format constant.
pub const META_NAME: &[u8] = b".bupm";

/// Marker suffix for split directories. The full marker is
/// `<depth>.bupd` at the split root.
pub const SPLIT_MARKER_SUFFIX: &str = ".bupd";

// ── Entry splitter ───────────────────────────────────────────────────────────

/// Decides where a sorted entry list is cut. One instance per layer; the
/// factory hands out fresh state so layers split independently.
pub trait EntrySplitter {
    /// Feed one entry name; `true` closes the current group after it.
    fn split_after(&mut self, name: &[u8]) -> bool;
}

/// Rolling-checksum splitter keyed on entry name bytes.
pub struct RollingEntrySplitter {
    sum:  Rollsum,
    mask: u32,
}

impl RollingEntrySplitter {
    pub fn new() -> Self {
        RollingEntrySplitter { sum: Rollsum::new(), mask: (1 << DIR_SPLIT_BITS) - 1 }
    }
}

impl Default for RollingEntrySplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EntrySplitter for RollingEntrySplitter {
    fn split_after(&mut self, name: &[u8]) -> bool {
        for &b in name {
            self.sum.roll(b);
        }
        self.sum.roll(0); // record separator
        self.sum.digest() & self.mask == 0
    }
}

/// Factory handing out one fresh splitter per layer.
pub type SplitterFactory<'a> = dyn FnMut() -> Box<dyn EntrySplitter> + 'a;

// ── Directory entries & metadata blobs ───────────────────────────────────────

/// One finished child of a directory, ready to be placed in a tree.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub mode: u32,
    pub name: Vec<u8>,
    pub id:   ObjectId,
    /// Serialized stat record from the indexer, stored verbatim in the
    /// covering `.bupm`.
    pub meta: Vec<u8>,
}

impl DirEntry {
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.clone();
        if mode_is_dir(self.mode) {
            key.push(b'/');
        }
        key
    }
}

/// Serialize a `.bupm` blob: per entry, name and stat record, each
/// length-prefixed, in the covered order.
pub fn encode_meta_blob(entries: &[DirEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        out.extend_from_slice(&(e.name.len() as u16).to_be_bytes());
        out.extend_from_slice(&e.name);
        out.extend_from_slice(&(e.meta.len() as u32).to_be_bytes());
        out.extend_from_slice(&e.meta);
    }
    out
}

/// Parse a `.bupm` blob back into `(name, stat)` records.
pub fn decode_meta_blob(bytes: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        if pos + 2 > bytes.len() {
            return Err(Error::corrupt(".bupm", "truncated name length"));
        }
        let name_len = u16::from_be_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        if pos + name_len + 4 > bytes.len() {
            return Err(Error::corrupt(".bupm", "truncated name"));
        }
        let name = bytes[pos..pos + name_len].to_vec();
        pos += name_len;
        let meta_len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + meta_len > bytes.len() {
            return Err(Error::corrupt(".bupm", "truncated stat record"));
        }
        out.push((name, bytes[pos..pos + meta_len].to_vec()));
        pos += meta_len;
    }
    Ok(out)
}

// ── Tree writing ─────────────────────────────────────────────────────────────

/// Object sink the directory encoder writes through. Trees and the
/// `.bupm`/marker blobs all belong to the meta pack stream.
pub trait DirSink {
    /// Write a tree object, returning its ID.
    fn write_tree(&mut self, payload: &[u8]) -> Result<ObjectId>;
    /// Write a metadata blob, returning its ID.
    fn write_meta(&mut self, payload: &[u8]) -> Result<ObjectId>;
}

/// Write one leaf tree: the entries plus their covering `.bupm`. An empty
/// directory is the bare canonical empty tree — there is no metadata to
/// cover, and the well-known empty-tree ID must stay reachable.
fn write_leaf(sink: &mut dyn DirSink, group: &[DirEntry]) -> Result<ObjectId> {
    if group.is_empty() {
        return sink.write_tree(&encode_tree(&[]));
    }
    let meta_id = sink.write_meta(&encode_meta_blob(group))?;
    let mut tes: Vec<TreeEntry> = group
        .iter()
        .map(|e| TreeEntry { mode: e.mode, name: e.name.clone(), id: e.id })
        .collect();
    tes.push(TreeEntry { mode: MODE_FILE, name: META_NAME.to_vec(), id: meta_id });
    canonical_sort(&mut tes);
    sink.write_tree(&encode_tree(&tes))
}

/// Shortest prefix length keeping every node's first entry name distinct
/// across one layer. Names arrive sorted, so only neighbors can collide.
fn distinct_prefix_len(names: &[&[u8]]) -> usize {
    let longest = names.iter().map(|n| n.len()).max().unwrap_or(1);
    for len in 1..=longest {
        let all_distinct = names.windows(2).all(|w| {
            w[0][..len.min(w[0].len())] != w[1][..len.min(w[1].len())]
        });
        if all_distinct {
            return len;
        }
    }
    longest
}

/// Encode a directory. With `treesplit` off (or nothing to split) this is
/// a single tree of the entries plus their `.bupm`; otherwise the
/// hashsplit hierarchy described in the module docs.
pub fn write_dir_tree(
    sink: &mut dyn DirSink,
    mut entries: Vec<DirEntry>,
    treesplit: bool,
    make_splitter: &mut SplitterFactory,
) -> Result<ObjectId> {
    entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    if !treesplit || entries.len() < 2 {
        return write_leaf(sink, &entries);
    }

    // Cut the sorted listing into leaf groups.
    let mut splitter = make_splitter();
    let mut groups: Vec<Vec<DirEntry>> = vec![Vec::new()];
    for e in entries {
        let split = splitter.split_after(&e.name);
        groups.last_mut().unwrap().push(e);
        if split {
            groups.push(Vec::new());
        }
    }
    groups.retain(|g| !g.is_empty());
    if groups.len() <= 1 {
        return write_leaf(sink, &groups.pop().unwrap());
    }

    // Leaf subtrees, each with its own `.bupm` slice.
    struct Node {
        /// Full name of the first entry beneath this node; prefixes of
        /// these name the layers above.
        first_name: Vec<u8>,
        id:         ObjectId,
    }
    let mut nodes: Vec<Node> = Vec::with_capacity(groups.len());
    for group in &groups {
        let id = write_leaf(sink, group)?;
        nodes.push(Node { first_name: group[0].name.clone(), id });
    }
    let mut depth = 1usize;

    // Re-apply the grouping per layer until one tree holds everything.
    loop {
        let first_names: Vec<&[u8]> = nodes.iter().map(|n| n.first_name.as_slice()).collect();
        let plen = distinct_prefix_len(&first_names);
        let named: Vec<TreeEntry> = nodes
            .iter()
            .map(|n| TreeEntry {
                mode: MODE_DIR,
                name: n.first_name[..plen.min(n.first_name.len())].to_vec(),
                id:   n.id,
            })
            .collect();

        let mut layer_splitter = make_splitter();
        let mut cuts: Vec<bool> = named
            .iter()
            .map(|te| layer_splitter.split_after(&te.name))
            .collect();
        // A trailing cut is meaningless; the list ends anyway.
        if let Some(last) = cuts.last_mut() {
            *last = false;
        }

        if !cuts.iter().any(|&c| c) {
            // Final layer: these names become the split root, plus the
            // depth marker.
            let marker_id = sink.write_meta(b"")?;
            let mut root = named;
            root.push(TreeEntry {
                mode: MODE_FILE,
                name: format!("{depth}{SPLIT_MARKER_SUFFIX}").into_bytes(),
                id:   marker_id,
            });
            canonical_sort(&mut root);
            return sink.write_tree(&encode_tree(&root));
        }

        let mut next: Vec<Node> = Vec::new();
        let mut start = 0usize;
        for (i, &cut) in cuts.iter().enumerate() {
            if cut || i + 1 == cuts.len() {
                let group = &named[start..=i];
                let id = sink.write_tree(&encode_tree(group))?;
                next.push(Node { first_name: nodes[start].first_name.clone(), id });
                start = i + 1;
            }
        }
        nodes = next;
        depth += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::{id_for, Kind};
    use crate::tree::decode_tree;
    use std::collections::HashMap;

    /// Splits unconditionally after every `n` entries, layer-local — the
    /// injected stand-in for the rolling splitter.
    struct EveryN {
        n:     usize,
        count: usize,
    }

    impl EntrySplitter for EveryN {
        fn split_after(&mut self, _name: &[u8]) -> bool {
            self.count += 1;
            self.count % self.n == 0
        }
    }

    struct MemSink {
        objects: HashMap<ObjectId, Vec<u8>>,
        metas:   HashMap<ObjectId, Vec<u8>>,
    }

    impl MemSink {
        fn new() -> Self {
            MemSink { objects: HashMap::new(), metas: HashMap::new() }
        }
    }

    impl DirSink for MemSink {
        fn write_tree(&mut self, payload: &[u8]) -> Result<ObjectId> {
            let id = id_for(Kind::Tree, payload);
            self.objects.insert(id, payload.to_vec());
            Ok(id)
        }
        fn write_meta(&mut self, payload: &[u8]) -> Result<ObjectId> {
            let id = id_for(Kind::Blob, payload);
            self.metas.insert(id, payload.to_vec());
            Ok(id)
        }
    }

    fn run(store: &mut MemSink, entries: Vec<DirEntry>, treesplit: bool, n: usize) -> ObjectId {
        let mut factory =
            move || Box::new(EveryN { n, count: 0 }) as Box<dyn EntrySplitter>;
        write_dir_tree(store, entries, treesplit, &mut factory).unwrap()
    }

    fn file_entries(names: &[&str]) -> Vec<DirEntry> {
        names
            .iter()
            .map(|name| DirEntry {
                mode: MODE_FILE,
                name: name.as_bytes().to_vec(),
                id:   id_for(Kind::Blob, name.as_bytes()),
                meta: format!("stat:{name}").into_bytes(),
            })
            .collect()
    }

    /// Walk a stored tree, returning `path -> (mode, id)` for every entry.
    fn walk(store: &MemSink, root: ObjectId, prefix: &str, out: &mut HashMap<String, u32>) {
        let entries = decode_tree(&store.objects[&root]).unwrap();
        for e in entries {
            let name = String::from_utf8(e.name.clone()).unwrap();
            let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
            if mode_is_dir(e.mode) && store.objects.contains_key(&e.id) {
                walk(store, e.id, &path, out);
            }
            out.insert(path, e.mode);
        }
    }

    #[test]
    fn unsplit_directory_has_entries_and_bupm() {
        let mut store = MemSink::new();
        let root = run(&mut store, file_entries(&["a", "b", "c"]), false, 5);
        let entries = decode_tree(&store.objects[&root]).unwrap();
        let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, [b".bupm".as_slice(), b"a", b"b", b"c"]);

        let meta = &store.metas[&entries[0].id];
        let records = decode_meta_blob(meta).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].0, b"a");
        assert_eq!(records[2].1, b"stat:c");
    }

    #[test]
    fn split_every_five_builds_prefix_layers() {
        // 26 files 00010001..00260026, forced split every 5 entries.
        let names: Vec<String> = (1..=26).map(|i| format!("{i:04}{i:04}")).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let mut store = MemSink::new();
        let root = run(&mut store, file_entries(&name_refs), true, 5);

        let mut paths = HashMap::new();
        walk(&store, root, "", &mut paths);

        assert!(paths.contains_key("000/0001/00010001"), "{paths:?}");
        assert!(paths.contains_key("002/0026/00260026"));
        assert!(paths.contains_key("002/0026/.bupm"));
        assert!(!paths.contains_key("002/.bupm"));
        assert!(paths.contains_key("2.bupd"), "split root must carry the depth marker");
    }

    #[test]
    fn split_and_unsplit_enumerate_the_same_entries() {
        let names: Vec<String> = (0..100).map(|i| format!("file{i:03}")).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();

        let mut split_store = MemSink::new();
        let split_root = run(&mut split_store, file_entries(&name_refs), true, 7);
        let mut plain_store = MemSink::new();
        let plain_root = run(&mut plain_store, file_entries(&name_refs), false, 7);

        // Structurally different objects…
        assert_ne!(split_root, plain_root);

        // …but the same logical entry set on walk-back.
        let mut split_paths = HashMap::new();
        walk(&split_store, split_root, "", &mut split_paths);
        let split_files: std::collections::HashSet<String> = split_paths
            .keys()
            .filter_map(|p| p.rsplit('/').next().map(String::from))
            .filter(|n| n.starts_with("file"))
            .collect();
        for name in &names {
            assert!(split_files.contains(name.as_str()), "missing {name}");
        }
    }

    #[test]
    fn single_group_degrades_to_plain_tree() {
        // Splitter that never fires: treesplit on, but nothing to split.
        let mut store = MemSink::new();
        let entries = file_entries(&["x", "y"]);
        let mut factory =
            || Box::new(EveryN { n: usize::MAX, count: 0 }) as Box<dyn EntrySplitter>;
        let root = write_dir_tree(&mut store, entries, true, &mut factory).unwrap();

        let names: Vec<Vec<u8>> = decode_tree(&store.objects[&root])
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [b".bupm".to_vec(), b"x".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn rolling_entry_splitter_is_deterministic() {
        let names: Vec<String> = (0..2000).map(|i| format!("entry-{i:06}")).collect();
        let cuts = |_: ()| -> Vec<bool> {
            let mut s = RollingEntrySplitter::new();
            names.iter().map(|n| s.split_after(n.as_bytes())).collect()
        };
        let a = cuts(());
        let b = cuts(());
        assert_eq!(a, b);
        let groups = a.iter().filter(|&&c| c).count();
        assert!(groups > 5, "2000 entries at 6 bits should cut many times, got {groups}");
    }
}
