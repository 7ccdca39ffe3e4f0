//! In-memory storage implementation for testing and ephemeral indexes.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

/// An in-memory storage implementation.
///
/// Useful for tests and for temporary indexes. Writes become visible to new
/// readers on every flush, which is what lets tests observe the same
/// intermediate states a crashed or concurrent process would see on disk.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// The files stored in memory.
    files: Arc<Mutex<HashMap<String, Box<[u8]>>>>,
}

impl MemoryStorage {
    /// Create a new, empty memory storage.
    pub fn new() -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    /// Replace a file's raw contents, creating it if absent.
    ///
    /// Test hook for fabricating corrupt or legacy files byte-by-byte.
    pub fn put_raw(&self, name: &str, data: Vec<u8>) {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), data.into_boxed_slice());
    }

    /// Read a file's raw contents, if present.
    pub fn get_raw(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).map(|d| d.to_vec())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock().unwrap();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(data.to_vec())))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().unwrap().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().unwrap().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.lock().unwrap();
        let mut names: Vec<String> = files.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock().unwrap();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(data.len() as u64)
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        // Memory is as durable as it gets; still verify the names exist so
        // sync discipline bugs show up in tests.
        let files = self.files.lock().unwrap();
        for name in names {
            if !files.contains_key(name) {
                return Err(StorageError::FileNotFound(name.to_string()).into());
            }
        }
        Ok(())
    }
}

/// A reader over an owned snapshot of one in-memory file.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
    size: u64,
}

impl MemoryInput {
    fn new(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A writer that publishes its buffer into the shared file map on flush.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    files: Arc<Mutex<HashMap<String, Box<[u8]>>>>,
    cursor: Cursor<Vec<u8>>,
}

impl MemoryOutput {
    fn new(name: String, files: Arc<Mutex<HashMap<String, Box<[u8]>>>>) -> Self {
        // The file becomes visible (empty) as soon as it is created, the
        // same way create_output does on a real filesystem.
        files
            .lock()
            .unwrap()
            .insert(name.clone(), Vec::new().into_boxed_slice());
        MemoryOutput {
            name,
            files,
            cursor: Cursor::new(Vec::new()),
        }
    }

    fn publish(&self) {
        self.files.lock().unwrap().insert(
            self.name.clone(),
            self.cursor.get_ref().clone().into_boxed_slice(),
        );
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.publish();
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.cursor.position())
    }

    fn close(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }
}
