//! Checksummed, atomically replaced bincode files
//!
//! File format:
//! ```text
//! +-------+---------+--------+--------+---------+
//! | Magic | Version | Length | CRC32C | Payload |
//! | 4B    | 4B      | 8B     | 4B     | var     |
//! +-------+---------+--------+--------+---------+
//! ```
//!
//! Writes go to a temporary sibling first and are renamed into place after
//! an fsync, so a crash leaves either the old or the new file.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Fixed header preceding the payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub length: u64,
    pub checksum: u32,
}

impl FileHeader {
    /// Serialize header to bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    #[must_use]
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut u32_at = [0u8; 4];
        let mut u64_at = [0u8; 8];

        u32_at.copy_from_slice(&buf[0..4]);
        let magic = u32::from_le_bytes(u32_at);
        u32_at.copy_from_slice(&buf[4..8]);
        let version = u32::from_le_bytes(u32_at);
        u64_at.copy_from_slice(&buf[8..16]);
        let length = u64::from_le_bytes(u64_at);
        u32_at.copy_from_slice(&buf[16..20]);
        let checksum = u32::from_le_bytes(u32_at);

        Self {
            magic,
            version,
            length,
            checksum,
        }
    }
}

/// Encode a value into a framed byte buffer
pub fn encode<T: Serialize>(magic: u32, value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)
        .map_err(|e| Error::Serialization(format!("failed to encode payload: {e}")))?;

    let header = FileHeader {
        magic,
        version: FORMAT_VERSION,
        length: payload.len() as u64,
        checksum: crc32c::crc32c(&payload),
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a framed byte buffer, verifying magic, length and checksum
pub fn decode<T: DeserializeOwned>(magic: u32, bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::DataCorruption("file shorter than header".into()));
    }

    let mut header_buf = [0u8; HEADER_SIZE];
    header_buf.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = FileHeader::from_bytes(&header_buf);

    if header.magic != magic {
        return Err(Error::DataCorruption(format!(
            "bad magic: expected {magic:#010x}, got {:#010x}",
            header.magic
        )));
    }

    if header.version != FORMAT_VERSION {
        return Err(Error::DataCorruption(format!(
            "unsupported format version {}",
            header.version
        )));
    }

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() as u64 != header.length {
        return Err(Error::DataCorruption(format!(
            "payload truncated: expected {} bytes, got {}",
            header.length,
            payload.len()
        )));
    }

    if crc32c::crc32c(payload) != header.checksum {
        return Err(Error::DataCorruption("checksum mismatch".into()));
    }

    bincode::deserialize(payload)
        .map_err(|e| Error::Deserialization(format!("failed to decode payload: {e}")))
}

/// Atomically write a framed value to `path`
pub fn write_file<T: Serialize>(path: &Path, magic: u32, value: &T) -> Result<u64> {
    let bytes = encode(magic, value)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("failed to create {}: {e}", dir.display())))?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = std::path::PathBuf::from(temp_name);

    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::Storage(format!("failed to create temp file: {e}")))?;

        let mut writer = BufWriter::new(file);
        writer
            .write_all(&bytes)
            .map_err(|e| Error::Storage(format!("failed to write file: {e}")))?;
        writer
            .flush()
            .map_err(|e| Error::Storage(format!("failed to flush file: {e}")))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::Storage(format!("failed to sync file: {e}")))?;
    }

    std::fs::rename(&temp_path, path)
        .map_err(|e| Error::Storage(format!("failed to rename file: {e}")))?;

    Ok(bytes.len() as u64)
}

/// Read a framed value from `path`; `Ok(None)` if the file does not exist
pub fn read_file<T: DeserializeOwned>(path: &Path, magic: u32) -> Result<Option<T>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Storage(format!("failed to open file: {e}"))),
    };

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| Error::Storage(format!("failed to read file: {e}")))?;

    decode(magic, &bytes).map(Some)
}

/// Size of the framed encoding of `value`
pub fn encoded_size<T: Serialize>(value: &T) -> Result<u64> {
    let payload = bincode::serialized_size(value)
        .map_err(|e| Error::Serialization(format!("failed to size payload: {e}")))?;
    Ok(payload + HEADER_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    const MAGIC: u32 = 0x5445_5354; // "TEST"

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u64>,
    }

    fn sample() -> Sample {
        Sample {
            name: "queue".into(),
            values: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.bin");

        let written = write_file(&path, MAGIC, &sample()).unwrap();
        assert_eq!(written, encoded_size(&sample()).unwrap());

        let loaded: Sample = read_file(&path, MAGIC).unwrap().unwrap();
        assert_eq!(loaded, sample());
        assert!(!dir.path().join("nested").join("state.bin.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let loaded: Option<Sample> = read_file(&dir.path().join("absent"), MAGIC).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = encode(MAGIC, &sample()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode::<Sample>(MAGIC, &bytes),
            Err(Error::DataCorruption(_))
        ));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let bytes = encode(MAGIC, &sample()).unwrap();
        assert!(decode::<Sample>(MAGIC + 1, &bytes).is_err());
        assert!(decode::<Sample>(MAGIC, &bytes[..10]).is_err());
    }
}
