//! The ordered, unique collection of live segments.

use std::collections::{HashMap, HashSet};

use ahash::AHashSet;

use crate::error::{FalxError, Result};
use crate::index::generation::{file_name_from_generation, SEGMENTS};
use crate::index::merge::MergeSpec;
use crate::index::segment::SegmentDescriptor;

/// The in-memory model of one committed (or about-to-be-committed) index
/// state: an ordered sequence of segment descriptors with set uniqueness,
/// plus the bookkeeping that ties it to its `segments_N` manifest.
///
/// Uniqueness is keyed by segment name. Names are allocated from `counter`
/// and never reused, so two descriptors with the same name always denote the
/// same segment.
#[derive(Debug, Clone)]
pub struct SegmentSet {
    /// Monotonic allocator for new segment names.
    counter: i32,

    /// Counts how often the index has been changed.
    version: i64,

    /// Generation of the `segments_N` for the next commit, -1 before the
    /// first read or write.
    generation: i64,

    /// Generation of the `segments_N` last successfully read or written.
    /// Normally equal to `generation`, except after an interrupted commit.
    last_generation: i64,

    /// Format tag of the manifest this set was last read from.
    format: i32,

    /// Opaque user data carried in the manifest.
    user_data: HashMap<String, String>,

    segments: Vec<SegmentDescriptor>,
    names: AHashSet<String>,
}

impl Default for SegmentSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentSet {
    /// Create an empty set with no on-disk history.
    pub fn new() -> Self {
        SegmentSet {
            counter: 0,
            version: 0,
            generation: -1,
            last_generation: -1,
            format: 0,
            user_data: HashMap::new(),
            segments: Vec::new(),
            names: AHashSet::new(),
        }
    }

    /// Number of segments in the set.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the set has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The segment at the given position.
    pub fn get(&self, index: usize) -> &SegmentDescriptor {
        &self.segments[index]
    }

    /// Iterate the segments in order.
    pub fn iter(&self) -> std::slice::Iter<'_, SegmentDescriptor> {
        self.segments.iter()
    }

    /// Mutably iterate the segments in order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, SegmentDescriptor> {
        self.segments.iter_mut()
    }

    /// The segments as an ordered slice.
    pub fn as_slice(&self) -> &[SegmentDescriptor] {
        &self.segments
    }

    /// Whether a segment with this name is in the set.
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Position of the named segment, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        if !self.names.contains(name) {
            return None;
        }
        self.segments.iter().position(|s| s.name() == name)
    }

    /// Append a segment.
    ///
    /// Fails with [`FalxError::DuplicateSegment`] if a segment with the same
    /// name is already present.
    pub fn add(&mut self, descriptor: SegmentDescriptor) -> Result<()> {
        if self.names.contains(descriptor.name()) {
            return Err(FalxError::DuplicateSegment(descriptor.name().to_string()));
        }
        self.names.insert(descriptor.name().to_string());
        self.segments.push(descriptor);
        debug_assert_eq!(self.names.len(), self.segments.len());
        Ok(())
    }

    /// Append every segment from an iterator.
    pub fn add_all<I: IntoIterator<Item = SegmentDescriptor>>(&mut self, iter: I) -> Result<()> {
        for descriptor in iter {
            self.add(descriptor)?;
        }
        Ok(())
    }

    /// Remove the named segment. Removing an absent segment is a no-op.
    pub fn remove(&mut self, name: &str) {
        if let Some(index) = self.index_of(name) {
            self.remove_at(index);
        }
    }

    /// Remove the segment at the given position.
    pub fn remove_at(&mut self, index: usize) -> SegmentDescriptor {
        let removed = self.segments.remove(index);
        self.names.remove(removed.name());
        debug_assert_eq!(self.names.len(), self.segments.len());
        removed
    }

    /// Remove all segments.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.names.clear();
    }

    /// Replace this set's contents with deep clones of another set's
    /// sequence.
    ///
    /// `generation`, `last_generation`, `version`, `counter` and `format`
    /// are deliberately kept, so a rollback to an earlier snapshot cannot
    /// step the generation backwards and break write-once file naming.
    pub fn replace(&mut self, other: &SegmentSet) -> Result<()> {
        self.clear();
        self.add_all(other.iter().cloned())
    }

    /// Apply the result of a finished merge.
    ///
    /// The first input still present in the sequence is replaced in place by
    /// the merged segment (unless `drop_segment` is set), every other input
    /// is removed, and the relative order of surviving segments is kept. If
    /// none of the inputs remain in the sequence -- they were all removed
    /// while the merge ran, so the merged segment must be all-deleted too --
    /// the merged segment is inserted at position 0 if it should not be
    /// dropped.
    pub fn apply_merge(&mut self, merge: &MergeSpec, drop_segment: bool) {
        let merged_away: AHashSet<&str> = merge.segments.iter().map(|s| s.name()).collect();
        let mut inserted = false;
        let mut new_seg_idx = 0;

        for seg_idx in 0..self.segments.len() {
            debug_assert!(seg_idx >= new_seg_idx);
            if merged_away.contains(self.segments[seg_idx].name()) {
                if !inserted && !drop_segment {
                    // At the first input hit nothing has been compacted yet,
                    // so seg_idx == new_seg_idx and the merged segment takes
                    // this slot.
                    self.segments[seg_idx] = merge.merged.clone();
                    inserted = true;
                    new_seg_idx += 1;
                }
            } else {
                self.segments.swap(new_seg_idx, seg_idx);
                new_seg_idx += 1;
            }
        }

        // Everything past new_seg_idx is a leftover duplicate slot.
        self.segments.truncate(new_seg_idx);

        if !inserted && !drop_segment {
            self.segments.insert(0, merge.merged.clone());
        }

        if !drop_segment {
            self.names.insert(merge.merged.name().to_string());
        }
        for name in &merged_away {
            self.names.remove(*name);
        }

        debug_assert_eq!(self.names.len(), self.segments.len());
    }

    /// Sum of `doc_count` across all segments. Deletions are not counted.
    pub fn total_doc_count(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.doc_count())).sum()
    }

    /// Record that the set has been logically changed. Call before
    /// committing.
    pub fn changed(&mut self) {
        self.version += 1;
    }

    /// Allocate a name for a new segment.
    pub fn new_segment_name(&mut self) -> String {
        let name = format!(
            "_{}",
            crate::index::generation::to_base36(self.counter as u64)
        );
        self.counter += 1;
        name
    }

    /// The change counter carried in the manifest.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The segment-name allocator state.
    pub fn counter(&self) -> i32 {
        self.counter
    }

    /// Generation of the next manifest to be written.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Generation of the last successfully read or written manifest.
    pub fn last_generation(&self) -> i64 {
        self.last_generation
    }

    /// Format tag of the manifest this set was last read from.
    pub fn format(&self) -> i32 {
        self.format
    }

    /// The opaque user data committed alongside the segments.
    pub fn user_data(&self) -> &HashMap<String, String> {
        &self.user_data
    }

    /// Replace the user data; `None` resets it to empty.
    pub fn set_user_data(&mut self, user_data: Option<HashMap<String, String>>) {
        self.user_data = user_data.unwrap_or_default();
    }

    /// Carry over generation numbers from another set.
    pub fn update_generation(&mut self, other: &SegmentSet) {
        self.generation = other.generation;
        self.last_generation = other.last_generation;
    }

    /// Name of the manifest this set was last read from or committed to.
    pub fn segments_file_name(&self) -> Option<String> {
        file_name_from_generation(self.last_generation)
    }

    /// Name of the manifest the next commit will write.
    pub fn next_segments_file_name(&self) -> String {
        let next_generation = if self.generation == -1 {
            1
        } else {
            self.generation + 1
        };
        format!(
            "{}_{}",
            SEGMENTS,
            crate::index::generation::to_base36(next_generation as u64)
        )
    }

    /// All file names this set accounts for: each segment's metadata sidecar
    /// and, when requested, the manifest itself.
    ///
    /// Asking for the manifest of a set that has never been committed or
    /// read is a precondition violation.
    pub fn files(&self, include_segments_file: bool) -> Result<HashSet<String>> {
        let mut files = HashSet::new();
        if include_segments_file {
            match self.segments_file_name() {
                Some(name) => {
                    files.insert(name);
                }
                None => {
                    return Err(FalxError::illegal_state(
                        "set has no committed manifest; last_generation is -1",
                    ));
                }
            }
        }
        for descriptor in &self.segments {
            files.insert(descriptor.sidecar_file_name());
        }
        Ok(files)
    }

    pub(crate) fn set_counter(&mut self, counter: i32) {
        self.counter = counter;
    }

    pub(crate) fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    pub(crate) fn set_generation(&mut self, generation: i64) {
        self.generation = generation;
    }

    pub(crate) fn set_last_generation(&mut self, last_generation: i64) {
        self.last_generation = last_generation;
    }

    pub(crate) fn set_format(&mut self, format: i32) {
        self.format = format;
    }
}
