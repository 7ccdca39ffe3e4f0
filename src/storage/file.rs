//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{FalxError, Result};
use crate::storage::{FileStorageConfig, Storage, StorageError, StorageInput, StorageOutput};

/// A file-based storage implementation rooted at a single directory.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,

    /// Storage configuration.
    config: FileStorageConfig,
}

impl FileStorage {
    /// Create a new file storage in the given directory, creating the
    /// directory if it does not exist.
    pub fn new<P: AsRef<Path>>(directory: P, config: FileStorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| FalxError::storage(format!("failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(FalxError::storage(format!(
                "path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory, config })
    }

    /// Get the full path for a file name.
    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    /// The root directory this storage operates on.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound(name.to_string())
            } else {
                StorageError::IoError(e.to_string())
            }
        })?;

        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_on_close,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError::IoError(format!("failed to delete {name}: {e}")))?;
        }
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.directory).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::DirectoryNotFound(self.directory.display().to_string())
            } else {
                StorageError::IoError(e.to_string())
            }
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let path = self.file_path(name);
        let metadata = path.metadata().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound(name.to_string())
            } else {
                StorageError::IoError(e.to_string())
            }
        })?;
        Ok(metadata.len())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            let path = self.file_path(name);
            let file = File::open(&path)
                .map_err(|e| StorageError::IoError(format!("cannot open {name} for sync: {e}")))?;
            file.sync_all()
                .map_err(|e| StorageError::IoError(format!("fsync {name} failed: {e}")))?;
        }
        Ok(())
    }
}

/// A buffered reader over one file.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let size = file
            .metadata()
            .map_err(|e| StorageError::IoError(e.to_string()))?
            .len();
        Ok(FileInput {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A buffered writer over one file.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    position: u64,
    sync_on_close: bool,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_on_close: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            position: 0,
            sync_on_close,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.position = self.writer.seek(pos)?;
        Ok(self.position)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        if self.sync_on_close {
            self.writer
                .get_ref()
                .sync_all()
                .map_err(|e| StorageError::IoError(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), FileStorageConfig::default()).unwrap();

        let mut output = storage.create_output("data.bin").unwrap();
        output.write_all(b"hello storage").unwrap();
        output.close().unwrap();

        assert!(storage.file_exists("data.bin"));
        assert_eq!(storage.file_size("data.bin").unwrap(), 13);

        let mut input = storage.open_input("data.bin").unwrap();
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello storage");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), FileStorageConfig::default()).unwrap();

        let mut output = storage.create_output("junk").unwrap();
        output.write_all(b"x").unwrap();
        output.close().unwrap();

        storage.delete_file("junk").unwrap();
        assert!(!storage.file_exists("junk"));
        // Deleting again must not fail.
        storage.delete_file("junk").unwrap();
    }

    #[test]
    fn test_list_files_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), FileStorageConfig::default()).unwrap();

        for name in ["b", "a", "c"] {
            let mut out = storage.create_output(name).unwrap();
            out.write_all(b"x").unwrap();
            out.close().unwrap();
        }

        assert_eq!(storage.list_files().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_directory_is_distinct() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), FileStorageConfig::default()).unwrap();

        std::fs::remove_dir_all(temp_dir.path()).unwrap();

        match storage.list_files() {
            Err(FalxError::NoSuchDirectory(_)) => {}
            other => panic!("expected NoSuchDirectory, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_named_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), FileStorageConfig::default()).unwrap();

        let mut out = storage.create_output("durable").unwrap();
        out.write_all(b"payload").unwrap();
        out.close().unwrap();

        storage.sync(&["durable".to_string()]).unwrap();
    }
}
