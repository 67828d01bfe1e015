//! # packstash — deduplicating, content-addressed backup engine
//!
//! Format guarantees (frozen):
//! - Object IDs are SHA-1 of `"<type> <len>\0" || payload`; never negotiated
//! - The rolling checksum (64-byte window, offset 31) is reproduced
//!   bit-for-bit; a deviation breaks dedup against every existing repository
//! - Packs are append-only: `PACK` v2 header, zlib records, SHA-1 trailer,
//!   content-addressed by their sorted ID set
//! - Idx v2 carries a 256-entry fanout and the object type in the CRC
//!   field's high bits; encrypted repositories restore from idxes alone
//! - An object ID appears in at most one pack; dedup is checked before
//!   every append
//! - Refs move only by compare-and-set, and only after every referenced
//!   pack is durable
//! - Encrypted storage hides object boundaries: fixed 64 KiB AEAD blocks,
//!   sealed per-pack keys, ciphertext length a pure function of plaintext
//!   length

pub mod errors;
pub mod oid;
pub mod rollsum;
pub mod split;
pub mod tree;
pub mod pack;
pub mod idx;
pub mod bloom;
pub mod midx;
pub mod store;
pub mod storage;
pub mod crypto;
pub mod config;
pub mod repo;
pub mod treesplit;
pub mod save;
pub mod walk;

// Flat re-exports for the most common types.
pub use config::Config;
pub use errors::{Error, Result};
pub use oid::{id_for, Kind, ObjectId};
pub use repo::{EncryptedRepo, PlainRepo, Repository};
pub use save::{save_stream, SaveOptions, WalkEntry};
pub use split::{HashSplitter, DEFAULT_BLOB_BITS};
pub use store::{PackKind, SaveSummary};
