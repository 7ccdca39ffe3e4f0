//! Error types for the Falx library.
//!
//! All fallible operations in Falx return [`Result`], whose error type is the
//! [`FalxError`] enum. Reader-side discovery treats a subset of these errors
//! as recoverable (see [`FalxError::is_retryable`]); everything else is
//! surfaced to the caller immediately.

use std::io;

use thiserror::Error;

/// The main error type for Falx operations.
#[derive(Error, Debug)]
pub enum FalxError {
    /// I/O errors (file operations, sync, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A manifest or sidecar failed checksum verification or had
    /// unexpected framing.
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    /// A recognized file uses a newer format version than this reader
    /// supports.
    #[error("format too new: {0}")]
    FormatTooNew(String),

    /// No `segments*` file exists in the directory.
    #[error("no manifest found: {0}")]
    IndexNotFound(String),

    /// The index directory itself is missing.
    #[error("no such directory: {0}")]
    NoSuchDirectory(String),

    /// Programming error: a segment with this name is already present.
    #[error("duplicate segment: {0}")]
    DuplicateSegment(String),

    /// Commit protocol methods called in the wrong order.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Storage-level errors not otherwise classified.
    #[error("storage error: {0}")]
    Storage(String),

    /// Admin dispatcher: a required request parameter is missing or invalid.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Admin dispatcher: coordinator timeout or watch fired without a
    /// response.
    #[error("server error: {0}")]
    ServerError(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors crossing in from external collaborators.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with [`FalxError`].
pub type Result<T> = std::result::Result<T, FalxError>;

impl FalxError {
    /// Create a new corrupt-manifest error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        FalxError::CorruptManifest(msg.into())
    }

    /// Create a new format-too-new error.
    pub fn format_too_new<S: Into<String>>(msg: S) -> Self {
        FalxError::FormatTooNew(msg.into())
    }

    /// Create a new index-not-found error.
    pub fn index_not_found<S: Into<String>>(msg: S) -> Self {
        FalxError::IndexNotFound(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        FalxError::Storage(msg.into())
    }

    /// Create a new illegal-state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        FalxError::IllegalState(msg.into())
    }

    /// Create a new bad-request error.
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        FalxError::BadRequest(msg.into())
    }

    /// Create a new server error.
    pub fn server<S: Into<String>>(msg: S) -> Self {
        FalxError::ServerError(msg.into())
    }

    /// Whether reader-side discovery may recover from this error by
    /// retrying against another generation.
    ///
    /// A corrupt or unreadable manifest most likely means a writer finished
    /// a commit between the moment the generation was located and the moment
    /// the file was opened. Everything else is a hard failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FalxError::Io(_) | FalxError::Storage(_) | FalxError::CorruptManifest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FalxError::corrupt("checksum mismatch in segments_4");
        assert_eq!(
            err.to_string(),
            "corrupt manifest: checksum mismatch in segments_4"
        );

        let err = FalxError::illegal_state("prepare was already called");
        assert_eq!(err.to_string(), "illegal state: prepare was already called");

        let err = FalxError::bad_request("missing required parameter: name");
        assert_eq!(
            err.to_string(),
            "bad request: missing required parameter: name"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(FalxError::corrupt("x").is_retryable());
        assert!(FalxError::storage("x").is_retryable());
        assert!(FalxError::Io(io::Error::other("x")).is_retryable());

        assert!(!FalxError::format_too_new("x").is_retryable());
        assert!(!FalxError::index_not_found("x").is_retryable());
        assert!(!FalxError::illegal_state("x").is_retryable());
        assert!(!FalxError::DuplicateSegment("_0".to_string()).is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        fn fails() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(FalxError::Io(_))));
    }
}
