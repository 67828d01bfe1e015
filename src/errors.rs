//! Crate-wide error type, one variant per failure kind.
//!
//! Variants classify *what happened*, not which module noticed it:
//! input problems surface to the caller with the offending path, transient
//! storage trouble is retried by the storage driver and only escalates to
//! `StorageFatal` once retries are exhausted, and corruption of a companion
//! file (idx, midx) quarantines that file rather than aborting the load.
//! Nothing is recovered by ignoring it silently.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed walk entry or a file that became unreadable mid-stream.
    /// Already-finalized packs stay valid; no ref is updated.
    #[error("input error on {path}: {reason}")]
    Input { path: PathBuf, reason: String },

    /// Network/disk hiccup that the storage driver retries with bounded
    /// backoff before escalating.
    #[error("transient storage failure on {name}: {reason}")]
    StorageTransient { name: String, reason: String },

    /// Retries exhausted or an unrecoverable storage condition. The session
    /// aborts; temp packs are unlinked and the repository is unchanged.
    #[error("storage failure on {name}: {reason}")]
    StorageFatal { name: String, reason: String },

    /// Digest mismatch or structural damage in a stored file. At load time
    /// the offending file is quarantined (renamed aside) and operation
    /// continues with the remaining files.
    #[error("corrupt file {name}: {reason}")]
    Corruption { name: String, reason: String },

    /// Ciphertext failed authentication. No partial recovery is attempted.
    #[error("authentication failed on {name} — wrong key or tampered data")]
    Auth { name: String },

    /// The compare-and-set on a ref lost the race more times than the
    /// retry cap allows.
    #[error("ref update on {name} lost the race after {attempts} attempts")]
    RefConflict { name: String, attempts: u32 },

    /// The repository root is missing, unreadable, or not a repository.
    /// The CLI maps this to exit code 3.
    #[error("repository inaccessible at {path}: {reason}")]
    Inaccessible { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Attach a storage name to a bare IO error, classifying it as fatal.
    pub fn storage(name: impl Into<String>, err: io::Error) -> Self {
        Error::StorageFatal { name: name.into(), reason: err.to_string() }
    }

    /// Corruption helper carrying the offending file name.
    pub fn corrupt(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Corruption { name: name.into(), reason: reason.into() }
    }
}
