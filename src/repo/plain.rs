//! Plain (unencrypted) repository over a local directory.
//!
//! Layout:
//!
//! ```text
//! <root>/config                    recognized settings (optional)
//! <root>/objects/pack/pack-*.pack  finalized packs
//! <root>/objects/pack/pack-*.idx   companion indexes
//! <root>/objects/pack/midx-*.midx  derived multi-index
//! <root>/refs/heads/<branch>       "<40-hex>\n", CAS-updated
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;
use tracing::debug;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::oid::{id_for, Kind, ObjectId};
use crate::pack::FinishedPack;
use crate::store::{ObjectStore, PackKind, PackSink, SaveSummary, StoreOptions};
use crate::storage::{ClassHint, LocalDriver, StorageDriver};

use super::Repository;

const PACK_DIR: &str = "objects/pack";

/// Attempts to grab the ref lock before giving up on a CAS.
const REF_LOCK_RETRIES: u32 = 50;

/// Moves finished packs into `objects/pack`. The idx was already placed
/// there by the store (the index dir and the durable dir coincide).
struct PlainSink {
    driver: LocalDriver,
}

impl PackSink for PlainSink {
    fn store_pack(&mut self, _kind: PackKind, finished: &FinishedPack) -> Result<()> {
        let name = format!("{PACK_DIR}/{}.pack", finished.name);
        self.driver
            .install_file(&finished.tmp_path, &name, ClassHint::data(finished.pack_len))
    }
}

pub struct PlainRepo {
    root:   PathBuf,
    config: Config,
    store:  ObjectStore<PlainSink>,
    driver: LocalDriver,
}

impl PlainRepo {
    /// Create the repository skeleton. Fails if one already exists here.
    pub fn init(root: &Path, config: Config) -> Result<PlainRepo> {
        if root.join(PACK_DIR).exists() {
            return Err(Error::Inaccessible {
                path:   root.to_path_buf(),
                reason: "repository already initialized".into(),
            });
        }
        std::fs::create_dir_all(root.join(PACK_DIR))?;
        std::fs::create_dir_all(root.join("refs/heads"))?;
        config.save(root)?;
        debug!(root = %root.display(), "initialized repository");
        Self::open(root)
    }

    pub fn open(root: &Path) -> Result<PlainRepo> {
        let pack_dir = root.join(PACK_DIR);
        if !pack_dir.is_dir() {
            return Err(Error::Inaccessible {
                path:   root.to_path_buf(),
                reason: "not a repository (objects/pack missing)".into(),
            });
        }
        let config = Config::load(root)?;
        let opts = StoreOptions {
            compression: config.compression(false),
            pack_size_limit: config.pack_size_limit,
            separatemeta: config.separatemeta,
            ..Default::default()
        };
        let sink = PlainSink { driver: LocalDriver::new(root) };
        let store = ObjectStore::open(&pack_dir, opts, sink)?;
        Ok(PlainRepo { root: root.to_path_buf(), config, store, driver: LocalDriver::new(root) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ref_name(branch: &str) -> String {
        format!("refs/heads/{branch}")
    }

    /// Read one object back: locate via idx/midx, ranged-read the record,
    /// decompress, verify the ID. The read side of invariant checks and
    /// the rebase path.
    pub fn read_object(&mut self, id: &ObjectId) -> Result<(Kind, Vec<u8>)> {
        let (idx_name, offset, kind) = self
            .store
            .locate(id)
            .ok_or_else(|| Error::corrupt(id.to_hex(), "object not found in any idx"))?;
        let pack_name = format!(
            "{PACK_DIR}/{}.pack",
            idx_name.strip_suffix(".idx").unwrap_or(idx_name)
        );

        let len_bytes = self.driver.read(&pack_name, Some((offset, 4)))?;
        let comp_len = BigEndian::read_u32(&len_bytes) as u64;
        let compressed = self.driver.read(&pack_name, Some((offset + 4, comp_len)))?;

        let mut payload = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut payload)
            .map_err(|e| Error::corrupt(&pack_name, format!("record at {offset}: {e}")))?;

        if id_for(kind, &payload) != *id {
            return Err(Error::corrupt(&pack_name, format!("record at {offset} hashes wrong")));
        }
        Ok((kind, payload))
    }
}

impl Repository for PlainRepo {
    fn exists(&mut self, id: &ObjectId) -> Result<bool> {
        Ok(self.store.exists(id))
    }

    fn write_object(&mut self, kind: Kind, payload: &[u8]) -> Result<ObjectId> {
        self.store.write(kind, payload)
    }

    fn write_meta_blob(&mut self, payload: &[u8]) -> Result<ObjectId> {
        self.store.write_meta_blob(payload)
    }

    fn finish(&mut self) -> Result<Vec<String>> {
        self.store.finish()
    }

    fn abort(&mut self) -> Result<()> {
        self.store.abort()
    }

    fn summary(&self) -> SaveSummary {
        self.store.summary().clone()
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn read_ref(&mut self, branch: &str) -> Result<Option<ObjectId>> {
        let Some(bytes) = self.driver.read_ref(&Self::ref_name(branch))? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| Error::corrupt(Self::ref_name(branch), "ref is not ASCII hex"))?;
        Ok(Some(ObjectId::from_hex(text.trim_end())?))
    }

    fn commit_ref(
        &mut self,
        branch: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<bool> {
        let name = Self::ref_name(branch);
        let expected_bytes = expected.map(|id| format!("{id}\n").into_bytes());
        let new_bytes = format!("{new}\n").into_bytes();

        // A held lock is another writer mid-swap, not a lost comparison;
        // wait it out briefly before reporting back.
        let mut attempt = 0;
        loop {
            match self
                .driver
                .cas_ref(&name, expected_bytes.as_deref(), &new_bytes)
            {
                Ok(won) => return Ok(won),
                Err(Error::StorageTransient { .. }) if attempt < REF_LOCK_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
