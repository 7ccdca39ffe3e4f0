//! The two-phase manifest commit engine.
//!
//! ```text
//!  IDLE --prepare--> PENDING --finish--> IDLE (generation advanced)
//!                       |
//!                       +---rollback--> IDLE (name burned, not advanced)
//! ```
//!
//! Between `prepare` and `finish` the new `segments_N` exists on disk with
//! an invalid trailing checksum, so concurrent readers that find it fail
//! verification and fall back through the discovery retry loop. `finish`
//! makes the checksum valid, fsyncs the manifest, and only then refreshes
//! the advisory `segments.gen` hint.

use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use log::warn;

use crate::error::{FalxError, Result};
use crate::index::codec::CodecRegistry;
use crate::index::generation::{FORMAT_SEGMENTS_GEN_CURRENT, SEGMENTS_GEN};
use crate::index::manifest::{ManifestCodec, PendingManifest};
use crate::index::segment_set::SegmentSet;
use crate::storage::{Storage, StorageOutput};

/// Two-phase commit of a [`SegmentSet`] to its directory.
///
/// At most one engine may be committing against a directory at a time; this
/// is enforced by the single index writer that owns the engine, not here.
#[derive(Debug)]
pub struct CommitEngine {
    storage: Arc<dyn Storage>,
    registry: Arc<CodecRegistry>,
    pending: Option<PendingManifest>,
}

impl CommitEngine {
    /// Create an engine bound to a directory and codec registry.
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<CodecRegistry>) -> Self {
        CommitEngine {
            storage,
            registry,
            pending: None,
        }
    }

    /// Whether a prepared commit is awaiting `finish` or `rollback`.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Start a commit: write the next `segments_N` with an invalid trailing
    /// checksum and keep its stream open.
    ///
    /// Call [`changed`](SegmentSet::changed) first if the set was modified.
    /// After this succeeds, exactly one of [`finish`](Self::finish) or
    /// [`rollback`](Self::rollback) must be called.
    pub fn prepare(&mut self, set: &mut SegmentSet) -> Result<()> {
        if self.pending.is_some() {
            return Err(FalxError::illegal_state("prepare was already called"));
        }
        let codec = ManifestCodec::new(&self.registry);
        self.pending = Some(codec.write(set, &self.storage)?);
        Ok(())
    }

    /// Complete a prepared commit: make the checksum valid, fsync the
    /// manifest, then refresh `segments.gen`.
    ///
    /// A failure to write `segments.gen` does not fail the commit; the file
    /// is only a fallback hint and the directory listing carries the truth.
    pub fn finish(&mut self, set: &mut SegmentSet) -> Result<()> {
        let mut pending = self
            .pending
            .take()
            .ok_or_else(|| FalxError::illegal_state("prepare was not called"))?;

        let completed = pending
            .output
            .finish_checksum()
            .and_then(|_| pending.output.close());
        if let Err(err) = completed {
            self.discard(&mut pending);
            return Err(err);
        }

        // A crash between here and the end of sync can leave a torn
        // segments_N; its checksum will not verify, so readers treat the
        // file as absent and load the previous generation.
        if let Err(err) = self.storage.sync(&[pending.file_name.clone()]) {
            if let Err(del_err) = self.storage.delete_file(&pending.file_name) {
                warn!(
                    "suppressed delete error on unsynced manifest {}: {del_err}",
                    pending.file_name
                );
            }
            return Err(err);
        }

        set.set_last_generation(set.generation());
        self.write_segments_gen(set.generation());
        Ok(())
    }

    /// Abort a prepared commit, deleting the partial manifest.
    ///
    /// The generation is deliberately not wound back: the next commit uses
    /// the following one, so no file name is ever reused.
    pub fn rollback(&mut self, _set: &mut SegmentSet) -> Result<()> {
        let mut pending = self
            .pending
            .take()
            .ok_or_else(|| FalxError::illegal_state("prepare was not called"))?;
        self.discard(&mut pending);
        Ok(())
    }

    /// Prepare and finish in one step.
    pub fn commit(&mut self, set: &mut SegmentSet) -> Result<()> {
        self.prepare(set)?;
        self.finish(set)
    }

    /// Close the pending stream and delete its file, suppressing errors.
    fn discard(&self, pending: &mut PendingManifest) {
        if let Err(err) = pending.output.close() {
            warn!(
                "suppressed close error on pending manifest {}: {err}",
                pending.file_name
            );
        }
        if let Err(err) = self.storage.delete_file(&pending.file_name) {
            warn!(
                "suppressed delete error on pending manifest {}: {err}",
                pending.file_name
            );
        }
    }

    /// Rewrite the advisory generation hint, swallowing every failure.
    fn write_segments_gen(&self, generation: i64) {
        let result: Result<()> = (|| {
            let mut output = self.storage.create_output(SEGMENTS_GEN)?;
            output.write_i32::<BigEndian>(FORMAT_SEGMENTS_GEN_CURRENT)?;
            // The generation is written twice so a torn write is detectable
            // on read.
            output.write_i64::<BigEndian>(generation)?;
            output.write_i64::<BigEndian>(generation)?;
            output.close()?;
            self.storage.sync(&[SEGMENTS_GEN.to_string()])
        })();

        if let Err(err) = result {
            warn!("failed to write {SEGMENTS_GEN}: {err}");
            if let Err(del_err) = self.storage.delete_file(SEGMENTS_GEN) {
                warn!("suppressed delete error on {SEGMENTS_GEN}: {del_err}");
            }
        }
    }
}
