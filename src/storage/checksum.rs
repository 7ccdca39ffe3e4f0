//! Checksummed stream wrappers for manifest I/O.
//!
//! Every byte written through [`ChecksumOutput`] feeds a running CRC-32 that
//! is finally emitted as a trailing 64-bit field; [`ChecksumInput`] keeps the
//! mirror checksum while reading and verifies the trailing field. Writer and
//! reader must agree byte-for-byte, so all fixed-width fields are big-endian
//! and strings are vint-length-prefixed UTF-8.
//!
//! The two-phase commit protocol needs a file that is on disk but not yet
//! readable: [`ChecksumOutput::write_invalid_checksum`] appends the bitwise
//! complement of the running checksum (which can never equal the true value),
//! and [`ChecksumOutput::finish_checksum`] later overwrites it in place.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FalxError, Result};
use crate::storage::{StorageInput, StorageOutput};

/// A checksumming writer over a storage output.
pub struct ChecksumOutput {
    output: Box<dyn StorageOutput>,
    hasher: crc32fast::Hasher,
    position: u64,
    pending_checksum_pos: Option<u64>,
}

impl std::fmt::Debug for ChecksumOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumOutput")
            .field("output", &self.output)
            .field("position", &self.position)
            .field("pending_checksum_pos", &self.pending_checksum_pos)
            .finish()
    }
}

impl ChecksumOutput {
    /// Wrap a storage output.
    pub fn new(output: Box<dyn StorageOutput>) -> Self {
        ChecksumOutput {
            output,
            hasher: crc32fast::Hasher::new(),
            position: 0,
            pending_checksum_pos: None,
        }
    }

    /// The running checksum over every payload byte written so far.
    pub fn checksum(&self) -> u64 {
        self.hasher.clone().finalize() as u64
    }

    /// Current write position.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn track(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.output.write_u8(value)?;
        self.track(&[value]);
        Ok(())
    }

    /// Write an i32 value (big-endian).
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.output.write_i32::<BigEndian>(value)?;
        self.track(&value.to_be_bytes());
        Ok(())
    }

    /// Write a u32 value (big-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.output.write_u32::<BigEndian>(value)?;
        self.track(&value.to_be_bytes());
        Ok(())
    }

    /// Write an i64 value (big-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.output.write_i64::<BigEndian>(value)?;
        self.track(&value.to_be_bytes());
        Ok(())
    }

    /// Write a u64 value (big-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.output.write_u64::<BigEndian>(value)?;
        self.track(&value.to_be_bytes());
        Ok(())
    }

    /// Write a variable-length unsigned integer (LEB128).
    pub fn write_vint(&mut self, mut value: u64) -> Result<()> {
        let mut encoded = Vec::with_capacity(10);
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                encoded.push(byte);
                break;
            }
            encoded.push(byte | 0x80);
        }
        self.output.write_all(&encoded)?;
        self.track(&encoded);
        Ok(())
    }

    /// Write a string as vint byte-length followed by UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        self.write_vint(bytes.len() as u64)?;
        self.output.write_all(bytes)?;
        self.track(bytes);
        Ok(())
    }

    /// Write a string-to-string map as an i32 count followed by key/value
    /// pairs, in sorted key order so identical maps serialize identically.
    pub fn write_string_map(&mut self, map: &HashMap<String, String>) -> Result<()> {
        self.write_i32(map.len() as i32)?;
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for key in keys {
            self.write_string(key)?;
            self.write_string(&map[key])?;
        }
        Ok(())
    }

    /// Append a deliberately invalid trailing checksum and flush, without
    /// syncing.
    ///
    /// Readers that open the file in this state must fail checksum
    /// verification. The position of the field is remembered so
    /// [`finish_checksum`](Self::finish_checksum) can overwrite it.
    pub fn write_invalid_checksum(&mut self) -> Result<()> {
        let pos = self.position;
        let invalid = !self.checksum();
        self.output.write_u64::<BigEndian>(invalid)?;
        self.output.flush().map_err(FalxError::Io)?;
        self.pending_checksum_pos = Some(pos);
        Ok(())
    }

    /// Overwrite the invalid trailing checksum with the true value and
    /// flush.
    pub fn finish_checksum(&mut self) -> Result<()> {
        let pos = self.pending_checksum_pos.take().ok_or_else(|| {
            FalxError::illegal_state("finish_checksum without write_invalid_checksum")
        })?;
        let checksum = self.checksum();
        self.output.seek(SeekFrom::Start(pos))?;
        self.output.write_u64::<BigEndian>(checksum)?;
        self.output.flush().map_err(FalxError::Io)?;
        Ok(())
    }

    /// One-shot close: append the true checksum, flush, close.
    pub fn finish(mut self) -> Result<()> {
        let checksum = self.checksum();
        self.output.write_u64::<BigEndian>(checksum)?;
        self.output.flush().map_err(FalxError::Io)?;
        self.output.close()
    }

    /// Close the underlying output without writing any checksum.
    pub fn close(&mut self) -> Result<()> {
        self.output.close()
    }
}

/// A checksumming reader over a storage input.
pub struct ChecksumInput {
    input: Box<dyn StorageInput>,
    hasher: crc32fast::Hasher,
    position: u64,
    size: u64,
}

impl std::fmt::Debug for ChecksumInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumInput")
            .field("input", &self.input)
            .field("position", &self.position)
            .field("size", &self.size)
            .finish()
    }
}

impl ChecksumInput {
    /// Wrap a storage input.
    pub fn new(input: Box<dyn StorageInput>) -> Result<Self> {
        let size = input.size()?;
        Ok(ChecksumInput {
            input,
            hasher: crc32fast::Hasher::new(),
            position: 0,
            size,
        })
    }

    /// The running checksum over every payload byte read so far.
    pub fn checksum(&self) -> u64 {
        self.hasher.clone().finalize() as u64
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total size of the input.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.input.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FalxError::corrupt("unexpected end of file")
            } else {
                FalxError::Io(e)
            }
        })?;
        self.hasher.update(buf);
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    /// Read an i32 value (big-endian).
    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Read a u32 value (big-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Read an i64 value (big-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Read a u64 value (big-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Read a variable-length unsigned integer (LEB128).
    pub fn read_vint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(FalxError::corrupt("vint too long"));
            }
        }
    }

    /// Read a vint-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let length = self.read_vint()? as usize;
        if self.position.saturating_add(length as u64) > self.size {
            return Err(FalxError::corrupt(format!(
                "string length {length} exceeds remaining file size"
            )));
        }
        let mut bytes = vec![0u8; length];
        self.fill(&mut bytes)?;
        String::from_utf8(bytes).map_err(|e| FalxError::corrupt(format!("invalid UTF-8: {e}")))
    }

    /// Read a string-to-string map (i32 count followed by key/value pairs).
    pub fn read_string_map(&mut self) -> Result<HashMap<String, String>> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(FalxError::corrupt(format!("negative map count: {count}")));
        }
        let mut map = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Read the trailing checksum field and compare it with the running
    /// checksum over everything read so far.
    ///
    /// The trailing field itself is excluded from the running checksum.
    pub fn verify_checksum(&mut self) -> Result<()> {
        let expected = self.checksum();
        let stored = self.input.read_u64::<BigEndian>().map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FalxError::corrupt("file too short for checksum")
            } else {
                FalxError::Io(e)
            }
        })?;
        self.position += 8;
        if stored != expected {
            return Err(FalxError::corrupt(format!(
                "checksum mismatch: stored {stored:#x}, computed {expected:#x}"
            )));
        }
        Ok(())
    }

    /// Close the underlying input.
    pub fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}
