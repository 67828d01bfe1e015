//! Object store facade — the single admission point for new objects.
//!
//! `write` is where the dedup-before-insert invariant lives: every object
//! is checked against the loaded midxes/idxes and the in-progress writers
//! before any bytes are appended, so an ID lands in at most one pack.
//! `exists` never returns a false negative; Bloom false positives are
//! resolved by the backing sorted arrays.
//!
//! Objects route to one of two pack streams: file-data blobs to
//! [`PackKind::Data`], trees/commits/metadata blobs to [`PackKind::Meta`].
//! With `separatemeta` off both streams share one writer; on, each stream
//! owns its own pack file sequence and the separation is preserved all the
//! way through the storage sink.
//!
//! Idx and midx files are loaded once at open. A file failing its digest
//! is quarantined (renamed aside) and the load proceeds without it; a midx
//! whose covered idxes are gone is stale and merely skipped.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::midx::{self, Midx};
use crate::oid::{id_for, Kind, ObjectId};
use crate::pack::{FinishedPack, PackWriter};
use crate::idx::PackIdx;

/// Which pack stream an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackKind {
    Data,
    Meta,
}

impl PackKind {
    fn slot(self) -> usize {
        match self {
            PackKind::Data => 0,
            PackKind::Meta => 1,
        }
    }
}

/// Where a closed pack (and its idx) becomes durable. The plain
/// repository renames into `objects/pack`; the encrypted one block-
/// encrypts the pack and seals the idx before upload.
pub trait PackSink {
    fn store_pack(&mut self, kind: PackKind, finished: &FinishedPack) -> Result<()>;
}

/// Tunables lifted from the repository config.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub compression:     i32,
    pub pack_size_limit: u64,
    pub separatemeta:    bool,
    /// Build a midx once more than this many idxes are live.
    pub midx_threshold:  usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            compression:     1,
            pack_size_limit: 1_000_000_000,
            separatemeta:    false,
            midx_threshold:  16,
        }
    }
}

/// Counters reported at the end of a save session.
#[derive(Debug, Default, Clone)]
pub struct SaveSummary {
    pub objects_written: u64,
    pub bytes_written:   u64,
    pub objects_reused:  u64,
    pub packs:           Vec<String>,
}

pub struct ObjectStore<S: PackSink> {
    index_dir: PathBuf,
    opts:      StoreOptions,
    sink:      S,
    idxes:     Vec<PackIdx>,
    midxes:    Vec<Midx>,
    /// Idx names already answered for by a loaded midx.
    covered:   HashSet<String>,
    writers:   [Option<PackWriter>; 2],
    summary:   SaveSummary,
}

/// Rename a damaged companion file aside so the load can proceed.
fn quarantine(path: &Path, err: &Error) {
    let aside = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.quarantine"),
        None => "quarantine".to_owned(),
    });
    warn!(file = %path.display(), error = %err, "quarantining corrupt file");
    if let Err(rename_err) = fs::rename(path, &aside) {
        warn!(file = %path.display(), error = %rename_err, "quarantine rename failed");
    }
}

impl<S: PackSink> ObjectStore<S> {
    /// Load every idx and midx under `index_dir`.
    pub fn open(index_dir: impl Into<PathBuf>, opts: StoreOptions, sink: S) -> Result<Self> {
        let index_dir = index_dir.into();
        fs::create_dir_all(&index_dir)?;

        let mut idxes = Vec::new();
        let mut midx_files = Vec::new();
        for entry in fs::read_dir(&index_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if name.ends_with(".idx") {
                let bytes = fs::read(&path)?;
                match PackIdx::parse(&name, &bytes) {
                    Ok(idx) => idxes.push(idx),
                    Err(e) => quarantine(&path, &e),
                }
            } else if name.ends_with(".midx") {
                midx_files.push((name, path));
            }
        }

        let idx_names: HashSet<&str> = idxes.iter().map(|i| i.name.as_str()).collect();
        let mut midxes = Vec::new();
        let mut covered = HashSet::new();
        for (name, path) in midx_files {
            let bytes = fs::read(&path)?;
            match Midx::parse(&name, &bytes) {
                Ok(m) => {
                    if m.idx_names.iter().any(|n| !idx_names.contains(n.as_str())) {
                        debug!(name = %name, "stale midx (covered idx missing), skipping");
                        continue;
                    }
                    covered.extend(m.idx_names.iter().cloned());
                    midxes.push(m);
                }
                Err(e) => quarantine(&path, &e),
            }
        }

        debug!(
            idxes = idxes.len(),
            midxes = midxes.len(),
            dir = %index_dir.display(),
            "object store opened"
        );

        Ok(ObjectStore {
            index_dir,
            opts,
            sink,
            idxes,
            midxes,
            covered,
            writers: [None, None],
            summary: SaveSummary::default(),
        })
    }

    pub fn summary(&self) -> &SaveSummary {
        &self.summary
    }

    pub fn options(&self) -> &StoreOptions {
        &self.opts
    }

    /// Is `id` stored — durably or in a not-yet-closed pack? No false
    /// negatives; Bloom false positives die at the sorted arrays.
    pub fn exists(&self, id: &ObjectId) -> bool {
        if self.writers.iter().flatten().any(|w| w.contains(id)) {
            return true;
        }
        if self.midxes.iter().any(|m| m.find(id).is_some()) {
            return true;
        }
        self.idxes
            .iter()
            .filter(|idx| !self.covered.contains(&idx.name))
            .any(|idx| idx.find(id).is_some())
    }

    /// Admit one object into the stream `kind` belongs to. Duplicate IDs
    /// are suppressed without touching the pack.
    pub fn write(&mut self, kind: Kind, payload: &[u8]) -> Result<ObjectId> {
        let stream = match kind {
            Kind::Blob => PackKind::Data,
            Kind::Tree | Kind::Commit => PackKind::Meta,
        };
        self.write_in(stream, kind, payload)
    }

    /// Admit a metadata blob (directory companion data) into the meta
    /// stream regardless of its blob type.
    pub fn write_meta_blob(&mut self, payload: &[u8]) -> Result<ObjectId> {
        self.write_in(PackKind::Meta, Kind::Blob, payload)
    }

    fn write_in(&mut self, stream: PackKind, kind: Kind, payload: &[u8]) -> Result<ObjectId> {
        let id = id_for(kind, payload);
        if self.exists(&id) {
            self.summary.objects_reused += 1;
            return Ok(id);
        }

        // Without separatemeta there is one mixed stream, labeled Data.
        let stream = if self.opts.separatemeta { stream } else { PackKind::Data };
        let slot = stream.slot();

        // Soft size cap, checked before appending: the open pack rolls
        // over when this object would push it past the limit. A single
        // oversized object still lands (in a pack of its own).
        if let Some(w) = &self.writers[slot] {
            if w.object_count() > 0 && w.size() + payload.len() as u64 > self.opts.pack_size_limit
            {
                self.rotate(slot, stream)?;
            }
        }

        if self.writers[slot].is_none() {
            self.writers[slot] =
                Some(PackWriter::create(&self.index_dir, self.opts.compression)?);
        }
        let writer = self.writers[slot].as_mut().unwrap();
        writer.add(kind, id, payload)?;
        self.summary.objects_written += 1;
        self.summary.bytes_written += payload.len() as u64;
        Ok(id)
    }

    fn rotate(&mut self, slot: usize, stream: PackKind) -> Result<()> {
        if let Some(writer) = self.writers[slot].take() {
            let finished = writer.close()?;
            // Pack first, idx second: an idx whose pack never landed would
            // satisfy dedup checks for objects that do not exist.
            self.sink.store_pack(stream, &finished)?;
            self.install_idx(&finished)?;
            self.summary.packs.push(finished.name);
        }
        Ok(())
    }

    /// Write the idx beside the other indexes (tmp + rename) and register
    /// it for lookups.
    fn install_idx(&mut self, finished: &FinishedPack) -> Result<()> {
        let idx_name = format!("{}.idx", finished.name);
        let target = self.index_dir.join(&idx_name);
        if !target.exists() {
            let tmp = self.index_dir.join(format!("{idx_name}.tmp"));
            fs::write(&tmp, &finished.idx_bytes)?;
            fs::File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, &target)?;
        }
        let idx = PackIdx::parse(&idx_name, &finished.idx_bytes)?;
        self.idxes.push(idx);
        Ok(())
    }

    /// Close all in-progress packs; returns the pack names finalized by
    /// this call. Rebuilds the midx when the idx count crosses the
    /// threshold. Safe to call more than once per session.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        let before = self.summary.packs.len();
        for stream in [PackKind::Data, PackKind::Meta] {
            let slot = stream.slot();
            match self.writers[slot].take() {
                Some(w) if w.object_count() > 0 => {
                    let finished = w.close()?;
                    self.sink.store_pack(stream, &finished)?;
                    self.install_idx(&finished)?;
                    self.summary.packs.push(finished.name);
                }
                Some(w) => w.abort()?,
                None => {}
            }
        }

        if self.idxes.len() > self.opts.midx_threshold {
            self.rebuild_midx()?;
        }

        let new_packs = self.summary.packs[before..].to_vec();
        if !new_packs.is_empty() {
            info!(packs = new_packs.len(), "finalized packs");
        }
        Ok(new_packs)
    }

    /// Abandon all in-progress packs. Temp files are unlinked; durable
    /// state is untouched.
    pub fn abort(&mut self) -> Result<()> {
        for writer in self.writers.iter_mut() {
            if let Some(w) = writer.take() {
                w.abort()?;
            }
        }
        Ok(())
    }

    fn rebuild_midx(&mut self) -> Result<()> {
        let refs: Vec<&PackIdx> = self.idxes.iter().collect();
        let (name, bytes) = midx::encode(&refs);
        let target = self.index_dir.join(&name);
        if !target.exists() {
            let tmp = self.index_dir.join(format!("{name}.tmp"));
            fs::write(&tmp, &bytes)?;
            fs::rename(&tmp, &target)?;
        }
        let m = Midx::parse(&name, &bytes)?;
        self.covered.extend(m.idx_names.iter().cloned());
        self.midxes.push(m);
        info!(name = %name, "rebuilt midx");
        Ok(())
    }

    /// Look up which idx holds `id` (for the read path). Checks midxes
    /// first, then uncovered idxes.
    pub fn locate(&self, id: &ObjectId) -> Option<(&str, u64, Kind)> {
        for m in &self.midxes {
            if let Some(idx_name) = m.find(id) {
                let idx = self.idxes.iter().find(|i| i.name == idx_name)?;
                return Some((idx.name.as_str(), idx.find(id)?, idx.kind_of(id)?));
            }
        }
        for idx in &self.idxes {
            if self.covered.contains(&idx.name) {
                continue;
            }
            if let Some(ofs) = idx.find(id) {
                return Some((idx.name.as_str(), ofs, idx.kind_of(id)?));
            }
        }
        None
    }
}

impl<S: PackSink> Drop for ObjectStore<S> {
    fn drop(&mut self) {
        // Leftover writers mean an abort path that forgot to clean up;
        // unlink the temp packs rather than leak them.
        if let Err(e) = self.abort() {
            warn!(error = %e, "failed to discard in-progress packs");
        }
    }
}
