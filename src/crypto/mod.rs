//! Key material and authenticated encryption for encrypted repositories.
//!
//! Three keys with distinct roles:
//! - **repokey** — symmetric 256-bit [`AeadKey`]. Wraps idxes, refs, and
//!   the keyfile's own secrets.
//! - **writekey** — X25519 public key. Every pack gets a fresh random data
//!   key sealed to the writekey, so a writer can add objects it can never
//!   read back.
//! - **readkey** — the matching X25519 secret key. Only holders can unseal
//!   pack secrets and decrypt data blobs.
//!
//! One framing convention for every ciphertext in the repository: the
//! public header comes first, the tagged ciphertext last.
//!
//! ```text
//! wrapped (symmetric):  nonce (12 B)                    || ct+tag
//! sealed  (asymmetric): ephemeral pk (32 B) || nonce (24 B) || ct+tag
//! ```
//!
//! The keyfile is a JSON document holding the repository UUID, the KDF
//! salt, the passphrase-wrapped repokey and readkey, and the plaintext
//! writekey. A keyfile without the wrapped readkey is a valid write-only
//! credential.

pub mod blocks;

use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::{Error as CrateError, Result as CrateResult};

/// Framing header of a wrapped (symmetric) ciphertext.
pub const WRAP_HEADER_LEN: usize = 12;

/// Framing header of a sealed (asymmetric) ciphertext.
pub const SEAL_HEADER_LEN: usize = 32 + 24;

// The keyfile is unlocked once per session, never per object, so the
// passphrase hash leans toward memory-hardness over latency.
const KDF_MEMORY_KIB: u32 = 128 * 1024;
const KDF_PASSES:     u32 = 4;
const KDF_LANES:      u32 = 1;

#[derive(Error, Debug)]
pub enum CryptoError {
    /// Authentication failed: wrong key or tampered bytes. Deliberately
    /// does not say which.
    #[error("ciphertext rejected — wrong key or tampered data")]
    Rejected,
    #[error("ciphertext shorter than its framing header")]
    Truncated,
    #[error("passphrase hashing failed: {0}")]
    Kdf(String),
    /// Encryption-side failure; practically unreachable with valid keys.
    #[error("sealing failed: {0}")]
    Seal(String),
    #[error("no readkey in this keyfile — repository is write-only here")]
    MissingReadKey,
    #[error("malformed keyfile: {0}")]
    BadKeyfile(String),
}

impl From<CryptoError> for CrateError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Rejected | CryptoError::Truncated => {
                CrateError::Auth { name: "ciphertext".into() }
            }
            other => CrateError::StorageFatal { name: "crypto".into(), reason: other.to_string() },
        }
    }
}

// ── Symmetric key (repokey, keyfile wrap key) ────────────────────────────────

/// A 256-bit AEAD key with a fixed role. Values stay in process memory;
/// on disk they only ever appear wrapped by another `AeadKey`.
#[derive(Clone)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    pub fn generate() -> Self {
        AeadKey(Aes256Gcm::generate_key(&mut OsRng).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        AeadKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Wrap `plaintext` under a fresh random nonce, returning the framed
    /// ciphertext.
    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let body = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Seal(e.to_string()))?;

        let mut framed = Vec::with_capacity(WRAP_HEADER_LEN + body.len());
        framed.extend_from_slice(nonce.as_slice());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    /// Open a ciphertext produced by [`AeadKey::wrap`].
    pub fn open(&self, framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if framed.len() < WRAP_HEADER_LEN {
            return Err(CryptoError::Truncated);
        }
        let (header, body) = framed.split_at(WRAP_HEADER_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(header), body)
            .map_err(|_| CryptoError::Rejected)
    }
}

/// Stretch a passphrase into the keyfile wrap key. Argon2id with the
/// repository's own salt, so a reused passphrase still yields unrelated
/// wrap keys across repositories.
pub fn passphrase_key(passphrase: &str, salt: &[u8]) -> Result<AeadKey, CryptoError> {
    let params = Params::new(KDF_MEMORY_KIB, KDF_PASSES, KDF_LANES, Some(32))
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let mut key = [0u8; 32];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(AeadKey(key))
}

// ── Asymmetric seal (writekey / readkey) ─────────────────────────────────────

/// Seal `plaintext` to a recipient public key under a throwaway keypair.
/// Sealing is non-deterministic, but the output length is a fixed function
/// of the input length — the same framing rule the symmetric wrap follows.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = SecretKey::generate(&mut OsRng);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let body = SalsaBox::new(recipient, &ephemeral)
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Seal(e.to_string()))?;

    let mut framed = Vec::with_capacity(SEAL_HEADER_LEN + body.len());
    framed.extend_from_slice(ephemeral.public_key().as_bytes());
    framed.extend_from_slice(nonce.as_slice());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Open a payload produced by [`seal`] with the recipient secret key.
pub fn unseal(recipient: &SecretKey, framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if framed.len() < SEAL_HEADER_LEN {
        return Err(CryptoError::Truncated);
    }
    let ephemeral_pk_bytes: [u8; 32] = framed[..32].try_into().unwrap();
    let ephemeral_pk = PublicKey::from(ephemeral_pk_bytes);
    let nonce = crypto_box::Nonce::from_slice(&framed[32..SEAL_HEADER_LEN]);
    SalsaBox::new(&ephemeral_pk, recipient)
        .decrypt(nonce, &framed[SEAL_HEADER_LEN..])
        .map_err(|_| CryptoError::Rejected)
}

// ── Keyfile ──────────────────────────────────────────────────────────────────

/// On-disk keyfile (JSON, hex-encoded fields).
#[derive(Debug, Serialize, Deserialize)]
pub struct Keyfile {
    pub repo_id:         Uuid,
    pub kdf_salt:        String,
    /// repokey wrapped with the passphrase-derived key.
    pub wrapped_repokey: String,
    /// X25519 public key, stored in the clear: writing needs no secret.
    pub writekey:        String,
    /// X25519 secret key wrapped with the passphrase-derived key. Absent
    /// on write-only keyfiles.
    pub wrapped_readkey: Option<String>,
}

/// Unwrapped, in-memory key set for one session.
pub struct Keys {
    pub repo_id:  Uuid,
    pub repokey:  AeadKey,
    pub writekey: PublicKey,
    pub readkey:  Option<SecretKey>,
}

fn decode_key32(field: &str, hex_str: &str) -> Result<[u8; 32], CryptoError> {
    let raw = hex::decode(hex_str)
        .map_err(|e| CryptoError::BadKeyfile(format!("{field}: {e}")))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| CryptoError::BadKeyfile(format!("{field}: wrong length")))
}

impl Keyfile {
    /// Generate a fresh key set wrapped under `passphrase`.
    pub fn generate(passphrase: &str) -> Result<Self, CryptoError> {
        let repo_id = Uuid::new_v4();
        let kdf_salt: [u8; 16] = *Uuid::new_v4().as_bytes();
        let wrap_key = passphrase_key(passphrase, &kdf_salt)?;

        let repokey = AeadKey::generate();
        let readkey = SecretKey::generate(&mut OsRng);
        let writekey = readkey.public_key();

        Ok(Keyfile {
            repo_id,
            kdf_salt:        hex::encode(kdf_salt),
            wrapped_repokey: hex::encode(wrap_key.wrap(repokey.as_bytes())?),
            writekey:        hex::encode(writekey.as_bytes()),
            wrapped_readkey: Some(hex::encode(wrap_key.wrap(&readkey.to_bytes())?)),
        })
    }

    /// Unwrap the keys with `passphrase`.
    pub fn unlock(&self, passphrase: &str) -> Result<Keys, CryptoError> {
        let salt = hex::decode(&self.kdf_salt)
            .map_err(|e| CryptoError::BadKeyfile(format!("kdf_salt: {e}")))?;
        let wrap_key = passphrase_key(passphrase, &salt)?;

        let wrapped = hex::decode(&self.wrapped_repokey)
            .map_err(|e| CryptoError::BadKeyfile(format!("wrapped_repokey: {e}")))?;
        let repokey_raw: [u8; 32] = wrap_key
            .open(&wrapped)?
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::BadKeyfile("repokey: wrong length".into()))?;

        let writekey = PublicKey::from(decode_key32("writekey", &self.writekey)?);

        let readkey = match &self.wrapped_readkey {
            None => None,
            Some(wrapped) => {
                let wrapped = hex::decode(wrapped)
                    .map_err(|e| CryptoError::BadKeyfile(format!("wrapped_readkey: {e}")))?;
                let raw: [u8; 32] = wrap_key
                    .open(&wrapped)?
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::BadKeyfile("readkey: wrong length".into()))?;
                Some(SecretKey::from(raw))
            }
        };

        Ok(Keys {
            repo_id: self.repo_id,
            repokey: AeadKey::from_bytes(repokey_raw),
            writekey,
            readkey,
        })
    }

    pub fn save(&self, path: &Path) -> CrateResult<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| CrateError::StorageFatal { name: "keyfile".into(), reason: e.to_string() })?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> CrateResult<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CrateError::corrupt(path.display().to_string(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_open_roundtrip() {
        let key = AeadKey::from_bytes([42u8; 32]);
        let framed = key.wrap(b"secret bytes").unwrap();
        assert_eq!(key.open(&framed).unwrap(), b"secret bytes");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let framed = AeadKey::from_bytes([1u8; 32]).wrap(b"data").unwrap();
        assert!(matches!(
            AeadKey::from_bytes([2u8; 32]).open(&framed),
            Err(CryptoError::Rejected)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = AeadKey::from_bytes([3u8; 32]);
        let mut framed = key.wrap(b"data").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0x01;
        assert!(key.open(&framed).is_err());
    }

    #[test]
    fn short_inputs_are_truncated_not_panics() {
        let key = AeadKey::from_bytes([4u8; 32]);
        assert!(matches!(key.open(b"short"), Err(CryptoError::Truncated)));
        let sk = SecretKey::generate(&mut OsRng);
        assert!(matches!(unseal(&sk, b"also short"), Err(CryptoError::Truncated)));
    }

    #[test]
    fn seal_roundtrip() {
        let readkey = SecretKey::generate(&mut OsRng);
        let writekey = readkey.public_key();
        let sealed = seal(&writekey, b"pack data key").unwrap();
        assert_eq!(unseal(&readkey, &sealed).unwrap(), b"pack data key");
    }

    #[test]
    fn seal_is_randomized_but_fixed_size() {
        let readkey = SecretKey::generate(&mut OsRng);
        let writekey = readkey.public_key();
        let a = seal(&writekey, b"same plaintext").unwrap();
        let b = seal(&writekey, b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn keyfile_generate_unlock() {
        let kf = Keyfile::generate("hunter2").unwrap();
        let keys = kf.unlock("hunter2").unwrap();
        assert!(keys.readkey.is_some());

        // The unlocked write/read pair must actually correspond.
        let sealed = seal(&keys.writekey, b"x").unwrap();
        assert_eq!(unseal(keys.readkey.as_ref().unwrap(), &sealed).unwrap(), b"x");
    }

    #[test]
    fn keyfile_wrong_passphrase() {
        let kf = Keyfile::generate("correct").unwrap();
        assert!(kf.unlock("incorrect").is_err());
    }

    #[test]
    fn write_only_keyfile_still_unlocks() {
        let mut kf = Keyfile::generate("pw").unwrap();
        kf.wrapped_readkey = None;
        let keys = kf.unlock("pw").unwrap();
        assert!(keys.readkey.is_none());
        // Sealing to the writekey still works without the readkey.
        seal(&keys.writekey, b"payload").unwrap();
    }
}
