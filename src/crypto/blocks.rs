//! Storage-block encryption — hides object boundaries and exact sizes
//! inside packs.
//!
//! # On-disk layout of an encrypted pack
//!
//! ```text
//! Offset  Size   Field
//!    0      4    magic       = "ENCP"
//!    4      2    version     = 1                       (u16 BE)
//!    6      2    sealed_len  = 112                     (u16 BE)
//!    8    112    sealed pack secret (to the writekey)
//!  120     12    block nonce salt
//!  132      *    ciphertext blocks, each exactly 64 KiB + 16 B
//! ```
//!
//! The pack secret is `data key (32 B) || plaintext length (u64 BE)`.
//!
//! The plaintext pack is zero-padded up to a whole number of 64 KiB
//! storage blocks (at least one), then every block is AES-256-GCM
//! encrypted under the pack's data key with nonce = `block index ⊕ salt`.
//! Key and salt are fresh per pack, so the deterministic nonces are
//! structurally unique. Every stored field has constant size and every
//! block is full, so the ciphertext length is a function of the *block
//! count* alone: an observer learns the packed size rounded up to 64 KiB
//! and nothing finer — no exact length, no record length prefixes, no
//! object count. The exact length travels inside the sealed secret, where
//! only readkey holders can use it to strip the padding back off.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crypto_box::{PublicKey, SecretKey};

use super::{seal, unseal, CryptoError, SEAL_HEADER_LEN};

/// Fixed storage-block size. Repository-wide constant; changing it would
/// re-key every block boundary and break length comparisons across packs.
pub const STORAGE_BLOCK_SIZE: usize = 64 * 1024;

/// GCM tag bytes appended to every block.
pub const BLOCK_TAG_LEN: usize = 16;

pub const ENCPACK_MAGIC:   &[u8; 4] = b"ENCP";
pub const ENCPACK_VERSION: u16      = 1;

/// Plaintext of the sealed pack secret: data key + true length.
const PACK_SECRET_LEN: usize = 32 + 8;

/// Sealed pack secret: seal header + secret + tag.
const SEALED_SECRET_LEN: usize = SEAL_HEADER_LEN + PACK_SECRET_LEN + BLOCK_TAG_LEN;

/// Fixed header bytes before the ciphertext blocks.
pub const ENCPACK_HEADER_LEN: usize = 8 + SEALED_SECRET_LEN + 12;

/// On-disk size of one full encrypted block.
const ENC_BLOCK_LEN: usize = STORAGE_BLOCK_SIZE + BLOCK_TAG_LEN;

/// Per-pack block cipher. Construct one per pack upload.
pub struct StorageBlockCipher {
    cipher: Aes256Gcm,
    salt:   [u8; 12],
}

impl StorageBlockCipher {
    fn new(key: &[u8; 32], salt: [u8; 12]) -> Result<Self, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::Seal(e.to_string()))?;
        Ok(StorageBlockCipher { cipher, salt })
    }

    /// Nonce for block `index`: the big-endian counter XORed into the salt.
    fn nonce(&self, index: u64) -> [u8; 12] {
        let mut n = self.salt;
        let mut counter = [0u8; 8];
        BigEndian::write_u64(&mut counter, index);
        for (slot, c) in n[4..].iter_mut().zip(counter) {
            *slot ^= c;
        }
        n
    }

    fn encrypt_block(&self, index: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce(index);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Seal(e.to_string()))
    }

    fn decrypt_block(&self, index: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce(index);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Rejected)
    }
}

/// Blocks needed to hold `len` plaintext bytes; an empty pack still
/// occupies one block so emptiness is indistinguishable from small.
fn block_count_for(len: usize) -> usize {
    len.div_ceil(STORAGE_BLOCK_SIZE).max(1)
}

/// Encrypt a whole plaintext pack for storage: fresh data key and exact
/// length sealed to the writekey, then full zero-padded blocks.
pub fn encrypt_pack(writekey: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let data_key: [u8; 32] = Aes256Gcm::generate_key(&mut OsRng).into();
    let salt: [u8; 12] = Aes256Gcm::generate_nonce(&mut OsRng).into();

    let mut secret = [0u8; PACK_SECRET_LEN];
    secret[..32].copy_from_slice(&data_key);
    BigEndian::write_u64(&mut secret[32..], plaintext.len() as u64);
    let sealed = seal(writekey, &secret)?;
    debug_assert_eq!(sealed.len(), SEALED_SECRET_LEN);

    let blocks = block_count_for(plaintext.len());
    let mut padded = plaintext.to_vec();
    padded.resize(blocks * STORAGE_BLOCK_SIZE, 0);

    let mut out = Vec::with_capacity(ENCPACK_HEADER_LEN + blocks * ENC_BLOCK_LEN);
    out.extend_from_slice(ENCPACK_MAGIC);
    out.write_u16::<BigEndian>(ENCPACK_VERSION).unwrap();
    out.write_u16::<BigEndian>(sealed.len() as u16).unwrap();
    out.extend_from_slice(&sealed);
    out.extend_from_slice(&salt);

    let cipher = StorageBlockCipher::new(&data_key, salt)?;
    for (index, block) in padded.chunks(STORAGE_BLOCK_SIZE).enumerate() {
        out.extend_from_slice(&cipher.encrypt_block(index as u64, block)?);
    }
    Ok(out)
}

/// Decrypt a pack produced by [`encrypt_pack`] and strip the padding.
/// Requires the readkey.
pub fn decrypt_pack(readkey: &SecretKey, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if bytes.len() < ENCPACK_HEADER_LEN {
        return Err(CryptoError::Truncated);
    }
    if &bytes[0..4] != ENCPACK_MAGIC {
        return Err(CryptoError::Rejected);
    }
    let version = BigEndian::read_u16(&bytes[4..6]);
    if version != ENCPACK_VERSION {
        return Err(CryptoError::Rejected);
    }
    let sealed_len = BigEndian::read_u16(&bytes[6..8]) as usize;
    if sealed_len != SEALED_SECRET_LEN {
        return Err(CryptoError::Rejected);
    }

    let secret = unseal(readkey, &bytes[8..8 + sealed_len])?;
    if secret.len() != PACK_SECRET_LEN {
        return Err(CryptoError::Rejected);
    }
    let data_key: [u8; 32] = secret[..32].try_into().unwrap();
    let true_len = BigEndian::read_u64(&secret[32..]) as usize;
    let salt: [u8; 12] = bytes[8 + sealed_len..8 + sealed_len + 12].try_into().unwrap();

    let cipher = StorageBlockCipher::new(&data_key, salt)?;
    let blocks = &bytes[ENCPACK_HEADER_LEN..];
    if blocks.len() % ENC_BLOCK_LEN != 0 {
        return Err(CryptoError::Truncated);
    }
    let mut out = Vec::with_capacity(blocks.len());
    for (index, block) in blocks.chunks(ENC_BLOCK_LEN).enumerate() {
        out.extend_from_slice(&cipher.decrypt_block(index as u64, block)?);
    }

    if true_len > out.len() {
        return Err(CryptoError::Rejected);
    }
    out.truncate(true_len);
    Ok(out)
}
