//! # Falx
//!
//! The segment-set commit manager of a search-engine index: maintains the
//! authoritative on-disk manifest (`segments_N`) enumerating the live
//! segments, and advances it from one consistent state to the next without
//! locks, renames, or trust in directory-listing freshness.
//!
//! ## Features
//!
//! - Durable two-phase manifest commits (prepare / finish / rollback)
//! - Write-once generation naming; crashed or rolled-back attempts never
//!   reuse a file name
//! - Reader-side generation discovery that tolerates stale NFS-style caches
//! - Checksummed manifest framing with a legacy-format read path and
//!   one-time sidecar upgrade
//! - Pluggable directory backends (file system, memory)

pub mod admin;
pub mod error;
pub mod index;
pub mod storage;

pub mod prelude {
    //! Commonly used imports.
    pub use crate::error::{FalxError, Result};
    pub use crate::index::{
        CodecRegistry, CommitAnchor, CommitEngine, FinderConfig, GenerationFinder, ManifestCodec,
        SegmentDescriptor, SegmentSet,
    };
    pub use crate::storage::{FileStorage, MemoryStorage, Storage};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
