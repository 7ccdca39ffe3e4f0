//! Storage abstraction layer for Falx.
//!
//! An index lives inside a single flat directory of files. This module
//! provides the pluggable directory interface the commit manager is written
//! against, with file-system and in-memory backends.
//!
//! The interface is deliberately rename-free: the commit protocol only ever
//! creates new files, fsyncs them, and deletes old ones, so it stays correct
//! on filesystems where rename is not atomic or directory caches are stale
//! (classically NFS).

use std::io::{Read, Seek, Write};

use serde::{Deserialize, Serialize};

pub mod checksum;
pub mod file;
pub mod memory;

pub use checksum::{ChecksumInput, ChecksumOutput};
pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::{FalxError, Result};

/// A flat directory of index files.
///
/// Implementations must tolerate concurrent readers while a single writer is
/// committing. `list_files` may serve stale results (NFS-style caching); the
/// generation-discovery logic is built to cope.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for sequential reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file of that name.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a file that does not exist is a no-op.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all file names in the directory.
    ///
    /// Fails with [`FalxError::NoSuchDirectory`] when the directory itself
    /// is gone, as opposed to a general I/O failure.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Durably persist the named files.
    ///
    /// After this returns, the contents of every named file must survive a
    /// crash.
    fn sync(&self, names: &[String]) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush buffered writes and sync them to the storage medium.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream, flushing buffered writes.
    fn close(&mut self) -> Result<()>;
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// Configuration for file-based storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Buffer size for I/O operations.
    pub buffer_size: usize,

    /// Whether to fsync every output on close, instead of only on
    /// [`Storage::sync`].
    pub sync_on_close: bool,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        FileStorageConfig {
            buffer_size: 65536,
            sync_on_close: false,
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// Directory not found.
    DirectoryNotFound(String),

    /// I/O error.
    IoError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "file not found: {name}"),
            StorageError::DirectoryNotFound(path) => write!(f, "directory not found: {path}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for FalxError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DirectoryNotFound(path) => FalxError::NoSuchDirectory(path),
            other => FalxError::storage(other.to_string()),
        }
    }
}
