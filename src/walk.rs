//! Filesystem walker — CLI glue turning local paths into the save
//! session's entry stream.
//!
//! The core's input contract is the depth-first, children-before-parent
//! ordering; `walkdir`'s `contents_first` mode yields exactly that, with
//! each directory record doubling as its subtree's close marker. Stat
//! records are a fixed binary serialization of the fields a restore needs;
//! canonicalization beyond that byte form is the indexer's business, not
//! ours.

use std::fs::{File, Metadata};
use std::io::Cursor;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use walkdir::WalkDir;

use crate::errors::{Error, Result};
use crate::save::WalkEntry;
use crate::tree::{MODE_DIR, MODE_SYMLINK};

/// Serialize the stat fields carried into `.bupm` records.
///
/// Layout (big-endian): mode u32, size u64, mtime secs i64, mtime nanos
/// u32, uid u32, gid u32.
pub fn encode_stat(meta: &Metadata) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.write_u32::<BigEndian>(meta.mode()).unwrap();
    out.write_u64::<BigEndian>(meta.size()).unwrap();
    out.write_i64::<BigEndian>(meta.mtime()).unwrap();
    out.write_u32::<BigEndian>(meta.mtime_nsec() as u32).unwrap();
    out.write_u32::<BigEndian>(meta.uid()).unwrap();
    out.write_u32::<BigEndian>(meta.gid()).unwrap();
    out
}

fn entry_for(path: &Path, meta: &Metadata) -> Result<WalkEntry> {
    let stat = encode_stat(meta);
    let file_type = meta.file_type();

    if file_type.is_dir() {
        return Ok(WalkEntry::Dir { path: path.to_path_buf(), mode: MODE_DIR, stat });
    }
    if file_type.is_symlink() {
        let target = std::fs::read_link(path)?;
        return Ok(WalkEntry::File {
            path:    path.to_path_buf(),
            mode:    MODE_SYMLINK,
            stat,
            content: Box::new(Cursor::new(
                target.to_string_lossy().into_owned().into_bytes(),
            )),
        });
    }

    // Regular file; preserve the executable bit in the stored mode.
    let mode = if meta.mode() & 0o111 != 0 { 0o100755 } else { 0o100644 };
    let reader = File::open(path).map_err(|e| Error::Input {
        path:   path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(WalkEntry::File { path: path.to_path_buf(), mode, stat, content: Box::new(reader) })
}

/// Walk `roots` depth-first, children before parents, yielding save input
/// records. Unreadable entries surface as `Input` errors in the stream.
pub fn walk_paths(roots: &[PathBuf]) -> impl Iterator<Item = Result<WalkEntry>> + '_ {
    roots.iter().flat_map(|root| {
        WalkDir::new(root)
            .contents_first(true)
            .follow_links(false)
            .into_iter()
            .map(|dirent| match dirent {
                Err(e) => Err(Error::Input {
                    path:   e.path().map(Path::to_path_buf).unwrap_or_default(),
                    reason: e.to_string(),
                }),
                Ok(dirent) => {
                    let meta = dirent.metadata().map_err(|e| Error::Input {
                        path:   dirent.path().to_path_buf(),
                        reason: e.to_string(),
                    })?;
                    entry_for(dirent.path(), &meta)
                }
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn children_arrive_before_their_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("data");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/inner.txt"), b"inner").unwrap();
        fs::write(root.join("top.txt"), b"top").unwrap();

        let entries: Vec<WalkEntry> = walk_paths(std::slice::from_ref(&root))
            .collect::<Result<_>>()
            .unwrap();
        let positions: Vec<(PathBuf, bool)> = entries
            .iter()
            .map(|e| match e {
                WalkEntry::File { path, .. } => (path.clone(), false),
                WalkEntry::Dir { path, .. } => (path.clone(), true),
            })
            .collect();

        let pos_of = |p: &Path| positions.iter().position(|(q, _)| q == p).unwrap();
        assert!(pos_of(&root.join("sub/inner.txt")) < pos_of(&root.join("sub")));
        assert!(pos_of(&root.join("sub")) < pos_of(&root));
        assert!(pos_of(&root.join("top.txt")) < pos_of(&root));
        assert!(positions[pos_of(&root)].1, "root must be a dir record");
    }

    #[test]
    fn stat_record_is_32_bytes_and_carries_the_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        fs::write(&path, b"x").unwrap();
        let stat = encode_stat(&fs::metadata(&path).unwrap());
        assert_eq!(stat.len(), 32);
        // size field sits at offset 4
        assert_eq!(&stat[4..12], &1u64.to_be_bytes());
    }
}
