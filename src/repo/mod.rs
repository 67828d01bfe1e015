//! Repository facade — the capability set the save path writes against.
//!
//! Two implementations share the pack/idx/midx machinery: [`PlainRepo`]
//! puts plaintext packs straight into `objects/pack/`, and
//! [`EncryptedRepo`] composes the same object store over the storage-block
//! cipher, keeping only a plaintext idx cache locally. Dispatch is a
//! trait, not inheritance; callers never learn which one they hold.

pub mod encrypted;
pub mod plain;

pub use encrypted::EncryptedRepo;
pub use plain::PlainRepo;

use crate::config::Config;
use crate::errors::Result;
use crate::oid::{Kind, ObjectId};
use crate::store::SaveSummary;
use crate::treesplit::DirSink;

/// Capabilities a save session needs from a repository.
pub trait Repository {
    /// Is `id` already stored (durably or in an open pack)? Never a false
    /// negative.
    fn exists(&mut self, id: &ObjectId) -> Result<bool>;

    /// Admit one object; a duplicate ID returns without writing.
    fn write_object(&mut self, kind: Kind, payload: &[u8]) -> Result<ObjectId>;

    /// Admit a metadata blob into the meta pack stream.
    fn write_meta_blob(&mut self, payload: &[u8]) -> Result<ObjectId>;

    /// Close all in-progress packs and make them durable. Must complete
    /// before any ref update that references their objects.
    fn finish(&mut self) -> Result<Vec<String>>;

    /// Discard all in-progress packs, leaving the repository unchanged.
    fn abort(&mut self) -> Result<()>;

    fn summary(&self) -> SaveSummary;

    fn config(&self) -> &Config;

    /// Current tip of `branch`, if the ref exists.
    fn read_ref(&mut self, branch: &str) -> Result<Option<ObjectId>>;

    /// Compare-and-set the branch tip. `expected == None` means the ref
    /// must not exist yet. Returns `false` when the comparison lost.
    fn commit_ref(
        &mut self,
        branch: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<bool>;
}

/// Every repository doubles as the directory encoder's object sink.
impl<R: Repository + ?Sized> DirSink for R {
    fn write_tree(&mut self, payload: &[u8]) -> Result<ObjectId> {
        self.write_object(Kind::Tree, payload)
    }

    fn write_meta(&mut self, payload: &[u8]) -> Result<ObjectId> {
        self.write_meta_blob(payload)
    }
}
