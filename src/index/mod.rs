//! Index manifest management for Falx.
//!
//! This module provides the segment-set commit manager: the in-memory model
//! of the live segment set, the `segments_N` manifest codec, the two-phase
//! commit engine that advances the on-disk manifest, and the retrying
//! generation discovery used by readers.

pub mod codec;
pub mod commit;
pub mod generation;
pub mod manifest;
pub mod merge;
pub mod segment;
pub mod segment_set;

// Re-export commonly used types
pub use codec::{
    CodecRegistry, CurrentCodec, LegacyCodec, SegmentCodec, CODEC_MAGIC, CURRENT_CODEC,
    LEGACY_CODEC,
};
pub use commit::CommitEngine;
pub use generation::{
    file_name_from_generation, generation_from_segments_file_name, last_commit_generation,
    last_commit_generation_in, last_commit_segments_file_name, CommitAnchor, FinderConfig,
    GenerationFinder, FORMAT_SEGMENTS_GEN_CURRENT, SEGMENTS, SEGMENTS_GEN,
};
pub use manifest::{ManifestCodec, FORMAT_3X, SEGMENTS_CODEC, VERSION_CURRENT};
pub use merge::{MergeCandidate, MergePolicy, MergeSpec, TieredMergePolicy};
pub use segment::{DocStore, SegmentDescriptor};
pub use segment_set::SegmentSet;
