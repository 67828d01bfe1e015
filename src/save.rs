//! The save session — walk entries in, one commit ID out.
//!
//! The indexer (or the bundled walker) streams entries depth-first with
//! children arriving before their parent directory's record. File contents
//! are hashsplit into blobs and assembled into chunk trees; directories
//! are encoded — tree-split when configured — as their children complete.
//! When the root closes, a commit object is written, all packs are made
//! durable, and only then is the branch ref advanced by compare-and-set.
//!
//! Losing the CAS is not an error: the commit is re-parented onto the new
//! tip, rewritten (one small object), and the CAS retried, up to
//! [`MAX_REF_RETRIES`] attempts. On any failure before the ref update the
//! temp packs are discarded and the repository is untouched.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::oid::{Kind, ObjectId};
use crate::repo::Repository;
use crate::split::split_reader;
use crate::tree::{encode_commit, ChunkTreeBuilder, CommitInfo, MODE_DIR};
use crate::treesplit::{write_dir_tree, DirEntry, EntrySplitter, RollingEntrySplitter};

/// Ref compare-and-set attempts before surfacing `RefConflict`.
pub const MAX_REF_RETRIES: u32 = 10;

// ── Walk input ───────────────────────────────────────────────────────────────

/// One record from the indexer. Directories arrive after their children
/// and double as the close marker for their subtree.
pub enum WalkEntry {
    File {
        path:    PathBuf,
        mode:    u32,
        stat:    Vec<u8>,
        content: Box<dyn Read>,
    },
    Dir {
        path: PathBuf,
        mode: u32,
        stat: Vec<u8>,
    },
}

impl WalkEntry {
    fn path(&self) -> &Path {
        match self {
            WalkEntry::File { path, .. } | WalkEntry::Dir { path, .. } => path,
        }
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

pub struct SaveOptions {
    pub branch:       String,
    /// Leading path components removed from every stored path.
    pub strip_prefix: Option<PathBuf>,
    /// Commit timestamp override; defaults to now.
    pub when:         Option<DateTime<Utc>>,
    pub message:      Option<String>,
}

impl SaveOptions {
    pub fn new(branch: impl Into<String>) -> Self {
        SaveOptions { branch: branch.into(), strip_prefix: None, when: None, message: None }
    }
}

// ── Saver ────────────────────────────────────────────────────────────────────

/// An open directory: entries accumulate until its walk record arrives.
struct Frame {
    path:    PathBuf,
    entries: Vec<DirEntry>,
}

struct Saver<'r, R: Repository> {
    repo:  &'r mut R,
    stack: Vec<Frame>,
}

impl<'r, R: Repository> Saver<'r, R> {
    fn new(repo: &'r mut R) -> Self {
        Saver {
            repo,
            stack: vec![Frame { path: PathBuf::new(), entries: Vec::new() }],
        }
    }

    /// Open intermediate frames so the stack ends at `dir`.
    fn ensure_open(&mut self, dir: &Path) {
        let mut open = self.stack.last().unwrap().path.clone();
        if open == dir {
            return;
        }
        let rest = dir.strip_prefix(&open).unwrap_or(dir).to_path_buf();
        for comp in rest.components() {
            if let Component::Normal(c) = comp {
                open.push(c);
                self.stack.push(Frame { path: open.clone(), entries: Vec::new() });
            }
        }
    }

    fn push_entry(&mut self, parent: &Path, entry: DirEntry) {
        self.ensure_open(parent);
        self.stack.last_mut().unwrap().entries.push(entry);
    }

    fn add_file(&mut self, path: &Path, mode: u32, stat: Vec<u8>, content: Box<dyn Read>) -> Result<()> {
        let name = file_name(path)?;
        let bits = self.repo.config().blobbits;

        let mut builder = ChunkTreeBuilder::new(mode);
        {
            let repo = &mut *self.repo;
            let mut emit = |blob: &[u8], level: u32| -> Result<()> {
                let id = repo.write_object(Kind::Blob, blob)?;
                builder.push(id, blob.len() as u64, level, &mut |kind, payload| {
                    repo.write_object(kind, payload)
                })
            };
            split_reader(content, bits, &mut emit).map_err(|e| match e {
                Error::Io(io) => Error::Input { path: path.to_path_buf(), reason: io.to_string() },
                other => other,
            })?;
        }
        let repo = &mut *self.repo;
        let (entry_mode, id) =
            builder.finish(&mut |kind, payload| repo.write_object(kind, payload))?;

        debug!(path = %path.display(), id = %id, "saved file");
        self.push_entry(
            parent_of(path),
            DirEntry { mode: entry_mode, name, id, meta: stat },
        );
        Ok(())
    }

    fn close_dir(&mut self, path: &Path, _mode: u32, stat: Vec<u8>) -> Result<()> {
        self.ensure_open(path);
        let frame = self.stack.pop().unwrap();
        debug_assert_eq!(frame.path, path);
        let id = self.write_dir(frame.entries)?;
        self.push_entry(
            parent_of(path),
            DirEntry { mode: MODE_DIR, name: file_name(path)?, id, meta: stat },
        );
        Ok(())
    }

    fn write_dir(&mut self, entries: Vec<DirEntry>) -> Result<ObjectId> {
        let treesplit = self.repo.config().treesplit;
        let mut factory =
            || Box::new(RollingEntrySplitter::new()) as Box<dyn EntrySplitter>;
        write_dir_tree(&mut *self.repo, entries, treesplit, &mut factory)
    }

    /// Close every still-open frame bottom-up and return the root tree.
    fn finish(mut self) -> Result<ObjectId> {
        while self.stack.len() > 1 {
            let frame = self.stack.pop().unwrap();
            let name = file_name(&frame.path)?;
            let id = self.write_dir(frame.entries)?;
            let parent = parent_of(&frame.path).to_path_buf();
            self.push_entry(&parent, DirEntry { mode: MODE_DIR, name, id, meta: Vec::new() });
        }
        let root = self.stack.pop().unwrap();
        self.write_dir(root.entries)
    }
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or(Path::new(""))
}

fn file_name(path: &Path) -> Result<Vec<u8>> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned().into_bytes())
        .ok_or_else(|| Error::Input {
            path:   path.to_path_buf(),
            reason: "walk entry has no file name".into(),
        })
}

/// Strip the configured prefix (or a leading root) from a walked path.
fn stored_path(path: &Path, strip: Option<&Path>) -> PathBuf {
    if let Some(prefix) = strip {
        if let Ok(rest) = path.strip_prefix(prefix) {
            return rest.to_path_buf();
        }
    }
    // No prefix match: drop any root/driver component.
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

// ── Entry point ──────────────────────────────────────────────────────────────

/// Run one save session over an entry stream and return the new commit
/// ID. The branch ref is advanced only after every referenced pack is
/// durable; a lost CAS re-parents and retries.
pub fn save_stream<R, I>(repo: &mut R, entries: I, opts: &SaveOptions) -> Result<ObjectId>
where
    R: Repository,
    I: IntoIterator<Item = Result<WalkEntry>>,
{
    let result = build_and_commit(repo, entries, opts);
    if result.is_err() {
        // Leave the repository exactly as it was: unlink temp packs, no
        // idx, no ref update.
        if let Err(abort_err) = repo.abort() {
            warn!(error = %abort_err, "cleanup after failed save also failed");
        }
    }
    result
}

fn build_and_commit<R, I>(repo: &mut R, entries: I, opts: &SaveOptions) -> Result<ObjectId>
where
    R: Repository,
    I: IntoIterator<Item = Result<WalkEntry>>,
{
    let strip = opts.strip_prefix.as_deref();
    let mut saver = Saver::new(repo);
    for entry in entries {
        let entry = entry?;
        let path = stored_path(entry.path(), strip);
        match entry {
            WalkEntry::File { mode, stat, content, .. } => {
                saver.add_file(&path, mode, stat, content)?
            }
            WalkEntry::Dir { mode, stat, .. } => {
                if path.as_os_str().is_empty() {
                    continue; // the walk root closes implicitly in finish()
                }
                saver.close_dir(&path, mode, stat)?
            }
        }
    }
    let tree = saver.finish()?;

    let mut commit = CommitInfo {
        tree,
        parents: Vec::new(),
        author:  "packstash".to_owned(),
        email:   "packstash@localhost".to_owned(),
        when:    opts.when.unwrap_or_else(Utc::now),
        message: opts
            .message
            .clone()
            .unwrap_or_else(|| format!("save: {}\n", opts.branch)),
    };

    let mut tip = repo.read_ref(&opts.branch)?;
    for attempt in 1..=MAX_REF_RETRIES {
        commit.parents = tip.into_iter().collect();
        let commit_id = repo.write_object(Kind::Commit, &encode_commit(&commit))?;

        // Ordering guarantee: every referenced pack is fsynced, renamed,
        // and driver-committed before the ref moves.
        repo.finish()?;

        if repo.commit_ref(&opts.branch, commit.parents.first(), &commit_id)? {
            let summary = repo.summary();
            info!(
                branch = %opts.branch,
                commit = %commit_id,
                objects = summary.objects_written,
                reused = summary.objects_reused,
                bytes = summary.bytes_written,
                "save complete"
            );
            return Ok(commit_id);
        }
        warn!(branch = %opts.branch, attempt, "ref update lost the race, rebasing");
        tip = repo.read_ref(&opts.branch)?;
    }

    Err(Error::RefConflict { name: opts.branch.clone(), attempts: MAX_REF_RETRIES })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::repo::PlainRepo;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn file(path: &str, data: &[u8]) -> Result<WalkEntry> {
        Ok(WalkEntry::File {
            path:    PathBuf::from(path),
            mode:    0o100644,
            stat:    format!("stat:{path}").into_bytes(),
            content: Box::new(Cursor::new(data.to_vec())),
        })
    }

    fn dir(path: &str) -> Result<WalkEntry> {
        Ok(WalkEntry::Dir {
            path: PathBuf::from(path),
            mode: 0o040755,
            stat: format!("stat:{path}").into_bytes(),
        })
    }

    fn test_repo(root: &Path) -> PlainRepo {
        PlainRepo::init(root, Config::default()).unwrap()
    }

    #[test]
    fn empty_save_commits_the_known_empty_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&tmp.path().join("repo"));
        let commit_id =
            save_stream(&mut repo, Vec::new(), &SaveOptions::new("main")).unwrap();

        let (kind, payload) = repo.read_object(&commit_id).unwrap();
        assert_eq!(kind, Kind::Commit);
        let (tree, parents) = crate::tree::parse_commit_refs(&payload).unwrap();
        assert!(parents.is_empty());
        assert_eq!(tree.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn nested_dirs_close_onto_their_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&tmp.path().join("repo"));
        let entries = vec![
            file("top/sub/inner.txt", b"inner"),
            dir("top/sub"),
            file("top/outer.txt", b"outer"),
            dir("top"),
        ];
        let commit_id = save_stream(&mut repo, entries, &SaveOptions::new("main")).unwrap();
        assert_eq!(repo.read_ref("main").unwrap(), Some(commit_id));

        let (_, commit) = repo.read_object(&commit_id).unwrap();
        let (root_tree, _) = crate::tree::parse_commit_refs(&commit).unwrap();
        let (_, root) = repo.read_object(&root_tree).unwrap();
        let names: Vec<Vec<u8>> = crate::tree::decode_tree(&root)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [b".bupm".to_vec(), b"top".to_vec()]);
    }

    #[test]
    fn second_identical_save_writes_no_new_pack_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");
        let payload = vec![7u8; 50_000];

        let mut repo = test_repo(&root);
        let mut opts = SaveOptions::new("main");
        opts.when = Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        save_stream(&mut repo, vec![file("data.bin", &payload)], &opts).unwrap();
        let first = repo.summary();
        assert!(first.objects_written > 2);
        assert!(first.bytes_written > 50_000);
        drop(repo);

        let mut repo = PlainRepo::open(&root).unwrap();
        save_stream(&mut repo, vec![file("data.bin", &payload)], &opts).unwrap();
        let second = repo.summary();
        // Every blob and tree deduplicates; only the re-parented commit
        // object is new the second time.
        assert_eq!(second.objects_written, 1);
        assert!(second.bytes_written < 300);
    }

    #[test]
    fn chained_saves_build_a_parent_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&tmp.path().join("repo"));

        let c1 = save_stream(&mut repo, vec![file("a", b"1")], &SaveOptions::new("main")).unwrap();
        let c2 = save_stream(&mut repo, vec![file("b", b"2")], &SaveOptions::new("main")).unwrap();
        assert_ne!(c1, c2);

        let (_, payload) = repo.read_object(&c2).unwrap();
        let (_, parents) = crate::tree::parse_commit_refs(&payload).unwrap();
        assert_eq!(parents, vec![c1]);
    }

    #[test]
    fn unreadable_file_aborts_without_touching_the_repo() {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");
        let mut repo = test_repo(&root);
        let entries = vec![Ok(WalkEntry::File {
            path:    PathBuf::from("bad.bin"),
            mode:    0o100644,
            stat:    Vec::new(),
            content: Box::new(FailingReader),
        })];
        let err = save_stream(&mut repo, entries, &SaveOptions::new("main")).unwrap_err();
        assert!(matches!(err, Error::Input { .. }));
        assert_eq!(repo.read_ref("main").unwrap(), None);

        // No temp packs left behind.
        let leftovers: Vec<_> = std::fs::read_dir(root.join("objects/pack"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn strip_prefix_controls_stored_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let mut repo = test_repo(&tmp.path().join("repo"));
        let mut opts = SaveOptions::new("main");
        opts.strip_prefix = Some(PathBuf::from("/home/user"));

        let entries = vec![
            file("/home/user/docs/note.txt", b"hi"),
            dir("/home/user/docs"),
        ];
        let commit_id = save_stream(&mut repo, entries, &opts).unwrap();

        let (_, commit) = repo.read_object(&commit_id).unwrap();
        let (root_tree, _) = crate::tree::parse_commit_refs(&commit).unwrap();
        let (_, root) = repo.read_object(&root_tree).unwrap();
        let names: Vec<Vec<u8>> = crate::tree::decode_tree(&root)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [b".bupm".to_vec(), b"docs".to_vec()]);
    }
}
