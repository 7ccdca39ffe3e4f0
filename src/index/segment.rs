//! Per-segment descriptor records.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FalxError, Result};
use crate::storage::Storage;

/// Writer version stamped on segments created by this library.
pub const SEGMENT_VERSION_CURRENT: &str = "4.0";

/// Location of a legacy shared document store, carried only so that legacy
/// segments re-serialize losslessly through the upgrade sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocStore {
    /// Offset of this segment's documents in the shared store.
    pub offset: i32,

    /// Name of the segment owning the shared store.
    pub segment: String,

    /// Whether the shared store is packed in a compound file.
    pub is_compound_file: bool,
}

/// Immutable-ish record of one indexed segment.
///
/// A descriptor belongs to exactly one directory; mixing descriptors from
/// different directories in one commit is a programming error and is
/// rejected at write time.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    name: String,
    codec_name: String,
    doc_count: u32,
    del_gen: i64,
    del_count: u32,
    version: Option<String>,

    /// Opaque key/value details about the writer that built this segment.
    pub diagnostics: HashMap<String, String>,

    /// Per-field norms generations, legacy segments only.
    pub norm_gen: Option<Vec<i64>>,

    /// Shared doc-store coordinates, legacy segments only.
    pub doc_store: Option<DocStore>,

    /// Whether the segment's files are packed in a compound file.
    pub is_compound_file: bool,

    /// Whether the segment stores term proximity data.
    pub has_prox: bool,

    /// Whether the segment stores term vectors.
    pub has_vectors: bool,

    dir: Arc<dyn Storage>,
}

impl SegmentDescriptor {
    /// Create a descriptor for a freshly written segment.
    ///
    /// Starts with no deletions (`del_gen == -1`, `del_count == 0`) and the
    /// current writer version.
    pub fn new(
        name: impl Into<String>,
        codec_name: impl Into<String>,
        doc_count: u32,
        dir: Arc<dyn Storage>,
    ) -> Self {
        SegmentDescriptor {
            name: name.into(),
            codec_name: codec_name.into(),
            doc_count,
            del_gen: -1,
            del_count: 0,
            version: Some(SEGMENT_VERSION_CURRENT.to_string()),
            diagnostics: HashMap::new(),
            norm_gen: None,
            doc_store: None,
            is_compound_file: false,
            has_prox: true,
            has_vectors: true,
            dir,
        }
    }

    /// Stable segment identifier, unique within a set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the per-segment codec that reads and writes this segment's
    /// own files.
    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    /// Re-stamp the per-segment codec, e.g. when a legacy manifest is read.
    pub fn set_codec_name(&mut self, codec_name: impl Into<String>) {
        self.codec_name = codec_name.into();
    }

    /// Number of documents in this segment, ignoring deletions.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Deletion generation: -1 means no deletions have been written yet.
    pub fn del_gen(&self) -> i64 {
        self.del_gen
    }

    /// Set the deletion generation. Values only move forward over a
    /// segment's lifetime.
    pub fn set_del_gen(&mut self, del_gen: i64) {
        self.del_gen = del_gen;
    }

    /// Advance to the next deletion generation.
    pub fn advance_del_gen(&mut self) {
        self.del_gen = if self.del_gen == -1 {
            1
        } else {
            self.del_gen + 1
        };
    }

    /// Number of deleted documents in this segment.
    pub fn del_count(&self) -> u32 {
        self.del_count
    }

    /// Set the number of deleted documents. Never exceeds `doc_count`.
    pub fn set_del_count(&mut self, del_count: u32) -> Result<()> {
        if del_count > self.doc_count {
            return Err(FalxError::illegal_state(format!(
                "del_count {} exceeds doc_count {} in segment {}",
                del_count, self.doc_count, self.name
            )));
        }
        self.del_count = del_count;
        Ok(())
    }

    /// Whether any documents are deleted.
    pub fn has_deletions(&self) -> bool {
        self.del_count > 0
    }

    /// Version string of the writer that created this segment.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Set the writer version string.
    pub fn set_version(&mut self, version: Option<String>) {
        self.version = version;
    }

    /// A segment is legacy when its writer version is unknown or predates
    /// the current sidecar layout.
    pub fn is_legacy(&self) -> bool {
        match &self.version {
            None => true,
            Some(v) => v.starts_with("3."),
        }
    }

    /// Name of this segment's metadata sidecar file.
    pub fn sidecar_file_name(&self) -> String {
        format!("{}.si", self.name)
    }

    /// The directory this segment lives in.
    pub fn dir(&self) -> &Arc<dyn Storage> {
        &self.dir
    }

    /// Whether this segment lives in the given directory.
    pub fn is_in_dir(&self, dir: &Arc<dyn Storage>) -> bool {
        Arc::ptr_eq(&self.dir, dir)
    }
}
