//! Encrypted repository — the plain machinery composed over the
//! storage-block cipher.
//!
//! Durable storage holds only ciphertext: packs as fixed-size AEAD blocks
//! under per-pack sealed keys, idxes and the ref file as whole-file AEAD
//! under the repokey. The plaintext idx/midx cache lives beside the
//! keyfile so existence checks never touch ciphertext.
//!
//! ```text
//! <root>/config                    recognized settings
//! <root>/keyfile                   wrapped key material
//! <root>/cache/                    plaintext idx/midx cache + pack spool
//! <root>/store/objects/pack/…      ciphertext packs and idxes
//! <root>/store/refs/<refsname>     encrypted branch map, CAS-updated
//! ```
//!
//! Refs for all branches share one encrypted blob per `refsname`;
//! concurrent writers that want to avoid CAS contention configure
//! disjoint `refsname`s and never touch each other's files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crypto_box::PublicKey;
use tracing::debug;

use crate::config::{Config, KEYFILE};
use crate::crypto::blocks::encrypt_pack;
use crate::crypto::{AeadKey, Keyfile, Keys};
use crate::errors::{Error, Result};
use crate::oid::{Kind, ObjectId};
use crate::pack::FinishedPack;
use crate::store::{ObjectStore, PackKind, PackSink, SaveSummary, StoreOptions};
use crate::storage::{ClassHint, LocalDriver, StorageDriver};

use super::Repository;

const STORE_DIR: &str = "store";
const CACHE_DIR: &str = "cache";

const REF_LOCK_RETRIES: u32 = 50;

/// Encrypts finished packs and their idxes on the way to the driver.
struct EncryptedSink {
    driver:   LocalDriver,
    writekey: PublicKey,
    repokey:  AeadKey,
}

impl PackSink for EncryptedSink {
    fn store_pack(&mut self, kind: PackKind, finished: &FinishedPack) -> Result<()> {
        let plaintext = fs::read(&finished.tmp_path)?;
        let pack_ct = encrypt_pack(&self.writekey, &plaintext)
            .map_err(|e| Error::StorageFatal { name: finished.name.clone(), reason: e.to_string() })?;
        let idx_ct = self
            .repokey
            .wrap(&finished.idx_bytes)
            .map_err(|e| Error::StorageFatal { name: finished.name.clone(), reason: e.to_string() })?;

        let hint = match kind {
            PackKind::Data => ClassHint::data(pack_ct.len() as u64),
            PackKind::Meta => ClassHint::meta(pack_ct.len() as u64),
        };
        self.driver
            .write(&format!("objects/pack/{}.pack", finished.name), &pack_ct, hint)?;
        self.driver.write(
            &format!("objects/pack/{}.idx", finished.name),
            &idx_ct,
            ClassHint::idx(idx_ct.len() as u64),
        )?;

        // The plaintext spool file must not outlive the upload.
        fs::remove_file(&finished.tmp_path)?;
        debug!(name = %finished.name, "uploaded encrypted pack");
        Ok(())
    }
}

pub struct EncryptedRepo {
    root:   PathBuf,
    config: Config,
    keys:   Keys,
    store:  ObjectStore<EncryptedSink>,
    driver: LocalDriver,
}

impl EncryptedRepo {
    /// Create an encrypted repository: layout, config, fresh key set
    /// wrapped under `passphrase`.
    pub fn init(root: &Path, passphrase: &str, mut config: Config) -> Result<EncryptedRepo> {
        if root.join(KEYFILE).exists() {
            return Err(Error::Inaccessible {
                path:   root.to_path_buf(),
                reason: "repository already initialized".into(),
            });
        }
        fs::create_dir_all(root.join(CACHE_DIR))?;
        fs::create_dir_all(root.join(STORE_DIR).join("objects/pack"))?;
        fs::create_dir_all(root.join(STORE_DIR).join("refs"))?;
        config.storage.get_or_insert_with(|| "local".to_owned());
        config.save(root)?;

        let keyfile = Keyfile::generate(passphrase)
            .map_err(|e| Error::StorageFatal { name: KEYFILE.into(), reason: e.to_string() })?;
        keyfile.save(&root.join(KEYFILE))?;
        debug!(root = %root.display(), "initialized encrypted repository");
        Self::open(root, passphrase)
    }

    pub fn open(root: &Path, passphrase: &str) -> Result<EncryptedRepo> {
        let keyfile_path = root.join(KEYFILE);
        if !keyfile_path.is_file() {
            return Err(Error::Inaccessible {
                path:   root.to_path_buf(),
                reason: "not an encrypted repository (keyfile missing)".into(),
            });
        }
        let config = Config::load(root)?;
        if let Some(driver) = config.storage.as_deref() {
            if driver != "local" {
                return Err(Error::StorageFatal {
                    name:   driver.to_owned(),
                    reason: "unknown storage driver".into(),
                });
            }
        }
        let keys = Keyfile::load(&keyfile_path)?
            .unlock(passphrase)
            .map_err(|e| Error::Auth { name: format!("{} ({e})", keyfile_path.display()) })?;

        let cache_dir = match &config.cachedir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.join(CACHE_DIR),
        };
        let opts = StoreOptions {
            compression: config.compression(true),
            pack_size_limit: config.pack_size_limit,
            separatemeta: config.separatemeta,
            ..Default::default()
        };
        let sink = EncryptedSink {
            driver:   LocalDriver::new(root.join(STORE_DIR)),
            writekey: keys.writekey.clone(),
            repokey:  keys.repokey.clone(),
        };
        let store = ObjectStore::open(&cache_dir, opts, sink)?;
        Ok(EncryptedRepo {
            root: root.to_path_buf(),
            config,
            keys,
            store,
            driver: LocalDriver::new(root.join(STORE_DIR)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    fn refs_name(&self) -> String {
        format!("refs/{}", self.config.refsname)
    }

    /// Decrypt the branch map from a stored refs blob.
    fn parse_refs(&self, name: &str, cipher: &[u8]) -> Result<BTreeMap<String, String>> {
        let plain = self
            .keys
            .repokey
            .open(cipher)
            .map_err(|_| Error::Auth { name: name.to_owned() })?;
        serde_json::from_slice(&plain).map_err(|e| Error::corrupt(name, e.to_string()))
    }
}

impl Repository for EncryptedRepo {
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
        let name = self.refs_name();
        let Some(cipher) = self.driver.read_ref(&name)? else {
            return Ok(None);
        };
        let map = self.parse_refs(&name, &cipher)?;
        match map.get(branch) {
            Some(hex) => Ok(Some(ObjectId::from_hex(hex)?)),
            None => Ok(None),
        }
    }

    fn commit_ref(
        &mut self,
        branch: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<bool> {
        let name = self.refs_name();
        let mut attempt = 0;
        loop {
            // Value-level comparison on the decrypted map; byte-level CAS
            // on the ciphertext so a racing writer is always detected.
            let current_cipher = self.driver.read_ref(&name)?;
            let mut map = match &current_cipher {
                Some(cipher) => self.parse_refs(&name, cipher)?,
                None => BTreeMap::new(),
            };
            if map.get(branch).map(String::as_str) != expected.map(|id| id.to_hex()).as_deref() {
                return Ok(false);
            }
            map.insert(branch.to_owned(), new.to_hex());

            let plain = serde_json::to_vec(&map)
                .map_err(|e| Error::StorageFatal { name: name.clone(), reason: e.to_string() })?;
            let cipher = self
                .keys
                .repokey
                .wrap(&plain)
                .map_err(|e| Error::StorageFatal { name: name.clone(), reason: e.to_string() })?;

            match self
                .driver
                .cas_ref(&name, current_cipher.as_deref(), &cipher)
            {
                Ok(true) => return Ok(true),
                // Raced between our read and the swap: the value may still
                // match, so look again rather than reporting a loss.
                Ok(false) => continue,
                Err(Error::StorageTransient { .. }) if attempt < REF_LOCK_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::blocks::decrypt_pack;
    use crate::oid::id_for;

    fn init(dir: &Path) -> EncryptedRepo {
        EncryptedRepo::init(&dir.join("repo"), "passphrase", Config::default()).unwrap()
    }

    #[test]
    fn stored_files_are_all_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = init(dir.path());
        repo.write_object(Kind::Blob, b"very secret contents").unwrap();
        repo.finish().unwrap();

        let pack_dir = repo.root().join("store/objects/pack");
        let mut saw_pack = false;
        for entry in fs::read_dir(&pack_dir).unwrap() {
            let path = entry.unwrap().path();
            let bytes = fs::read(&path).unwrap();
            assert!(
                !bytes.windows(6).any(|w| w == b"secret"),
                "plaintext leaked into {}",
                path.display()
            );
            if path.extension().is_some_and(|e| e == "pack") {
                saw_pack = true;
                assert_eq!(&bytes[0..4], b"ENCP");
            }
        }
        assert!(saw_pack);
    }

    #[test]
    fn readkey_recovers_the_plaintext_pack() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = init(dir.path());
        repo.write_object(Kind::Blob, b"recoverable payload").unwrap();
        let packs = repo.finish().unwrap();
        assert_eq!(packs.len(), 1);

        let ct = fs::read(repo.root().join(format!("store/objects/pack/{}.pack", packs[0]))).unwrap();
        let plain = decrypt_pack(repo.keys().readkey.as_ref().unwrap(), &ct).unwrap();
        assert_eq!(&plain[0..4], b"PACK");
        // The plaintext idx cache matches the sealed idx content.
        let idx_ct = fs::read(repo.root().join(format!("store/objects/pack/{}.idx", packs[0]))).unwrap();
        let idx_plain = repo.keys().repokey.open(&idx_ct).unwrap();
        let cached = fs::read(repo.root().join(format!("cache/{}.idx", packs[0]))).unwrap();
        assert_eq!(idx_plain, cached);
    }

    #[test]
    fn dedup_survives_reopen_via_cache() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut repo = init(dir.path());
            repo.write_object(Kind::Blob, b"stable bytes").unwrap();
            repo.finish().unwrap();
        }
        let mut repo = EncryptedRepo::open(&dir.path().join("repo"), "passphrase").unwrap();
        repo.write_object(Kind::Blob, b"stable bytes").unwrap();
        assert_eq!(repo.summary().objects_written, 0);
        assert_eq!(repo.summary().objects_reused, 1);
    }

    #[test]
    fn wrong_passphrase_is_auth_failure() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path());
        assert!(matches!(
            EncryptedRepo::open(&dir.path().join("repo"), "nope"),
            Err(Error::Auth { .. })
        ));
    }

    #[test]
    fn encrypted_refs_roundtrip_and_cas() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = init(dir.path());
        let a = id_for(Kind::Commit, b"a");
        let b = id_for(Kind::Commit, b"b");

        assert_eq!(repo.read_ref("main").unwrap(), None);
        assert!(repo.commit_ref("main", None, &a).unwrap());
        assert_eq!(repo.read_ref("main").unwrap(), Some(a));
        assert!(!repo.commit_ref("main", None, &b).unwrap());
        assert!(repo.commit_ref("main", Some(&a), &b).unwrap());
        assert_eq!(repo.read_ref("main").unwrap(), Some(b));

        // The stored blob never exposes branch names or hex tips.
        let raw = fs::read(repo.root().join("store/refs/refs")).unwrap();
        assert!(!raw.windows(4).any(|w| w == b"main"));
        assert!(!raw.windows(6).any(|w| w == b.to_hex()[..6].as_bytes()));
    }
}
