//! Repository configuration — the recognized-settings table.
//!
//! A JSON `config` file at the repository root. Every key has a default;
//! unknown keys are rejected at load so a typo fails loudly instead of
//! silently changing nothing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// File name of the config document inside a repository.
pub const CONFIG_FILE: &str = "config";

/// File name of the keyfile marking a repository as encrypted.
pub const KEYFILE: &str = "keyfile";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// zlib level used inside packs; falls back to `core.compression`.
    #[serde(rename = "pack.compression")]
    pub pack_compression: Option<i32>,

    /// Fallback zlib level. Unset means -1 for encrypted repositories
    /// (CPU goes to crypto, let zlib pick) and 1 otherwise.
    #[serde(rename = "core.compression")]
    pub core_compression: Option<i32>,

    /// Soft cap on pack size in bytes, enforced before appending.
    #[serde(rename = "pack.packSizeLimit")]
    pub pack_size_limit: u64,

    /// Hashsplit boundary significance.
    #[serde(rename = "stash.blobbits")]
    pub blobbits: u32,

    /// Hashsplit large directory listings into bounded subtrees.
    #[serde(rename = "stash.treesplit")]
    pub treesplit: bool,

    /// Route data and meta objects into separate pack streams.
    #[serde(rename = "stash.separatemeta")]
    pub separatemeta: bool,

    /// Ref file basename; concurrent writers use disjoint names to avoid
    /// compare-and-set contention.
    #[serde(rename = "stash.refsname")]
    pub refsname: String,

    /// Local plaintext index cache for encrypted repositories.
    #[serde(rename = "stash.cachedir")]
    pub cachedir: Option<PathBuf>,

    /// Storage driver selector. Only `"local"` ships in-tree.
    #[serde(rename = "stash.storage")]
    pub storage: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pack_compression: None,
            core_compression: None,
            pack_size_limit:  1_000_000_000,
            blobbits:         13,
            treesplit:        false,
            separatemeta:     false,
            refsname:         "refs".to_owned(),
            cachedir:         None,
            storage:          None,
        }
    }
}

impl Config {
    /// Load `<repo>/config`; a missing file means all defaults.
    pub fn load(repo_root: &Path) -> Result<Config> {
        let path = repo_root.join(CONFIG_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::corrupt(path.display().to_string(), e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(Error::Inaccessible {
                path:   repo_root.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn save(&self, repo_root: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::corrupt(CONFIG_FILE, e.to_string()))?;
        fs::write(repo_root.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Effective zlib level: `pack.compression`, else `core.compression`,
    /// else the encryption-dependent default.
    pub fn compression(&self, encrypted: bool) -> i32 {
        self.pack_compression
            .or(self.core_compression)
            .unwrap_or(if encrypted { -1 } else { 1 })
    }
}
