//! Merge proposals and the merge-policy collaborator.
//!
//! Deciding *what* to merge is not this crate's concern; a policy proposes
//! candidate groups and whoever executes the merge hands the finished bundle
//! back to [`SegmentSet::apply_merge`](crate::index::SegmentSet::apply_merge).

use serde::{Deserialize, Serialize};

use crate::index::segment::SegmentDescriptor;
use crate::index::segment_set::SegmentSet;

/// A finished merge: the input segments that were consumed and the single
/// segment that replaced them.
#[derive(Debug, Clone)]
pub struct MergeSpec {
    /// Segments consumed by the merge.
    pub segments: Vec<SegmentDescriptor>,

    /// The segment holding the merged result.
    pub merged: SegmentDescriptor,
}

/// A candidate group of segments a policy proposes to merge.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    /// Names of the segments to merge, in set order.
    pub segments: Vec<String>,

    /// Priority score; higher merges first.
    pub priority: f64,
}

/// Strategy for proposing segment merges.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Propose merge candidates for the current set.
    fn find_merges(&self, set: &SegmentSet) -> Vec<MergeCandidate>;

    /// Whether the set has accumulated enough segments to merge at all.
    fn should_merge(&self, set: &SegmentSet) -> bool;
}

/// Size-tiered merge policy: when the set holds too many segments, group the
/// smallest ones together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredMergePolicy {
    /// Maximum number of segments before merging kicks in.
    pub max_segments: usize,

    /// Number of segments to merge at once.
    pub segments_per_merge: usize,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            max_segments: 10,
            segments_per_merge: 4,
        }
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(&self, set: &SegmentSet) -> Vec<MergeCandidate> {
        if !self.should_merge(set) {
            return Vec::new();
        }

        let mut by_size: Vec<&SegmentDescriptor> = set.iter().collect();
        by_size.sort_by_key(|s| s.doc_count());

        let mut candidates = Vec::new();
        for chunk in by_size.chunks(self.segments_per_merge) {
            if chunk.len() < 2 {
                continue;
            }
            let total: u64 = chunk.iter().map(|s| u64::from(s.doc_count())).sum();
            candidates.push(MergeCandidate {
                segments: chunk.iter().map(|s| s.name().to_string()).collect(),
                // Small groups merge first: they cost little and reduce the
                // segment count the most per byte moved.
                priority: 1.0 / (total as f64 + 1.0),
            });
        }

        candidates.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
        candidates
    }

    fn should_merge(&self, set: &SegmentSet) -> bool {
        set.len() > self.max_segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn build_set(doc_counts: &[u32]) -> SegmentSet {
        let dir: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut set = SegmentSet::new();
        for (i, docs) in doc_counts.iter().enumerate() {
            set.add(SegmentDescriptor::new(
                format!("_{i}"),
                "falx1",
                *docs,
                Arc::clone(&dir),
            ))
            .unwrap();
        }
        set
    }

    #[test]
    fn test_no_merges_below_threshold() {
        let policy = TieredMergePolicy::default();
        let set = build_set(&[10, 20, 30]);

        assert!(!policy.should_merge(&set));
        assert!(policy.find_merges(&set).is_empty());
    }

    #[test]
    fn test_small_segments_grouped_first() {
        let policy = TieredMergePolicy {
            max_segments: 4,
            segments_per_merge: 3,
        };
        let set = build_set(&[1000, 10, 20, 30, 2000, 40]);

        let candidates = policy.find_merges(&set);
        assert!(!candidates.is_empty());

        // The highest-priority candidate holds the smallest segments.
        let first = &candidates[0];
        assert_eq!(first.segments.len(), 3);
        assert!(first.segments.contains(&"_1".to_string()));
        assert!(first.segments.contains(&"_2".to_string()));
        assert!(first.segments.contains(&"_3".to_string()));
    }
}
