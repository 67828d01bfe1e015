//! Storage drivers — the boundary between the core and durable bytes.
//!
//! A driver exposes five capabilities: prefix listing, ranged reads,
//! put-if-absent writes of finalized names, compare-and-set on ref files,
//! and delete (unused by save). `write` carries a [`ClassHint`] so tiered
//! backends can place small/large index/meta/data objects differently; the
//! local driver ignores it.
//!
//! Transient failures are retried here with bounded backoff; once retries
//! are exhausted the error escalates to `StorageFatal` and the session
//! aborts. `cas_ref` is the only operation requiring strict atomicity — on
//! the local driver it is realized with an exclusively created lock file
//! plus atomic rename.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{Error, Result};

// ── Placement hints ──────────────────────────────────────────────────────────

/// Placement class for tiered backends. Small/large is decided by the
/// caller against the per-class thresholds below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassHint {
    IdxSmall,
    IdxLarge,
    MetaSmall,
    MetaLarge,
    DataSmall,
    DataLarge,
}

/// Size thresholds separating the small and large tiers.
pub const IDX_THRESHOLD:  u64 = 1024 * 1024;
pub const META_THRESHOLD: u64 = 1024 * 1024;
pub const DATA_THRESHOLD: u64 = 64 * 1024 * 1024;

impl ClassHint {
    pub fn idx(len: u64) -> Self {
        if len < IDX_THRESHOLD { ClassHint::IdxSmall } else { ClassHint::IdxLarge }
    }
    pub fn meta(len: u64) -> Self {
        if len < META_THRESHOLD { ClassHint::MetaSmall } else { ClassHint::MetaLarge }
    }
    pub fn data(len: u64) -> Self {
        if len < DATA_THRESHOLD { ClassHint::DataSmall } else { ClassHint::DataLarge }
    }
}

// ── Driver trait ─────────────────────────────────────────────────────────────

pub trait StorageDriver {
    /// Names under `prefix`, relative to the driver root.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read `name`, optionally a `(offset, len)` range.
    fn read(&self, name: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>>;

    /// Durably store `bytes` under a finalized name. Put-if-absent: a name
    /// that already exists is left untouched (finalized names are
    /// content-addressed, so the bytes are identical by construction).
    fn write(&mut self, name: &str, bytes: &[u8], hint: ClassHint) -> Result<()>;

    /// Move an already-written local temp file into place. Same semantics
    /// as `write` without buffering the payload in memory.
    fn install_file(&mut self, tmp: &Path, name: &str, hint: ClassHint) -> Result<()>;

    /// Atomically replace the ref file `name`: succeeds only if the current
    /// content equals `expected` (`None` = must not exist). Returns `false`
    /// when the comparison failed — the caller lost a race.
    fn cas_ref(&mut self, name: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool>;

    /// Current content of a ref file, if present.
    fn read_ref(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Unused by the save path; here for the capability set.
    fn delete(&mut self, name: &str) -> Result<()>;
}

// ── Retry policy ─────────────────────────────────────────────────────────────

const RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE: Duration = Duration::from_millis(20);

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Run `op`, retrying transient IO failures with doubling backoff.
/// Exhausted retries escalate to `StorageFatal`.
fn with_retries<T>(name: &str, mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
    let mut delay = RETRY_BASE;
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt < RETRY_ATTEMPTS => {
                attempt += 1;
                warn!(name, attempt, error = %e, "transient storage error, retrying");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) if is_transient(&e) => {
                return Err(Error::StorageFatal {
                    name:   name.to_owned(),
                    reason: format!("retries exhausted: {e}"),
                })
            }
            Err(e) => return Err(Error::storage(name, e)),
        }
    }
}

// ── Local filesystem driver ──────────────────────────────────────────────────

/// Driver rooted at a directory. Writes go to a temp sibling, are fsynced,
/// and renamed into place, so readers only ever observe complete files.
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDriver { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn tmp_sibling(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.tmp-{}", Uuid::new_v4()))
    }
}

impl StorageDriver for LocalDriver {
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // Split "objects/pack/pack-" into its directory and name prefix.
        let (dir, stem) = match prefix.rfind('/') {
            Some(i) => (&prefix[..i], &prefix[i + 1..]),
            None => ("", prefix),
        };
        let dir_path = self.root.join(dir);
        if !dir_path.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir_path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            if file_name.starts_with(stem) {
                if dir.is_empty() {
                    names.push(file_name.to_owned());
                } else {
                    names.push(format!("{dir}/{file_name}"));
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
        let path = self.full(name);
        with_retries(name, || {
            let mut f = fs::File::open(&path)?;
            match range {
                None => {
                    let mut buf = Vec::new();
                    f.read_to_end(&mut buf)?;
                    Ok(buf)
                }
                Some((offset, len)) => {
                    f.seek(SeekFrom::Start(offset))?;
                    let mut buf = vec![0u8; len as usize];
                    f.read_exact(&mut buf)?;
                    Ok(buf)
                }
            }
        })
    }

    fn write(&mut self, name: &str, bytes: &[u8], _hint: ClassHint) -> Result<()> {
        let target = self.full(name);
        if target.exists() {
            debug!(name, "already stored, skipping");
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_sibling(name);
        with_retries(name, || {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
            Ok(())
        })?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn install_file(&mut self, tmp: &Path, name: &str, _hint: ClassHint) -> Result<()> {
        let target = self.full(name);
        if target.exists() {
            debug!(name, "already stored, removing duplicate temp");
            fs::remove_file(tmp)?;
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(tmp, &target)?;
        Ok(())
    }

    fn cas_ref(&mut self, name: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let target = self.full(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        // The lock file serializes the read-compare-write; rename keeps the
        // swap atomic for readers outside the lock.
        let lock_path = self.full(&format!("{name}.lock"));
        let lock = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path);
        let mut lock = match lock {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::StorageTransient {
                    name:   name.to_owned(),
                    reason: "ref is locked by another writer".into(),
                })
            }
            Err(e) => return Err(Error::storage(name, e)),
        };

        let result = (|| -> Result<bool> {
            let current = match fs::read(&target) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(Error::storage(name, e)),
            };
            if current.as_deref() != expected {
                return Ok(false);
            }
            lock.write_all(new)?;
            lock.sync_all()?;
            fs::rename(&lock_path, &target)?;
            Ok(true)
        })();

        // On failure or comparison miss the lock file must not linger.
        if !matches!(result, Ok(true)) {
            let _ = fs::remove_file(&lock_path);
        }
        result
    }

    fn read_ref(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.full(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(name, e)),
        }
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        fs::remove_file(self.full(name))?;
        Ok(())
    }
}
