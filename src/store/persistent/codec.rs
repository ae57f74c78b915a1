//! Binary framing for the container file.
//!
//! Layout:
//! ```text
//! [magic: 4 bytes "STEM"][version: 1 byte][length: 8 bytes LE][body: N bytes JSON][crc32: 4 bytes LE]
//! ```
//!
//! The body is the serde JSON form of the node tree. The CRC covers the body
//! only.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying a stemflow container file.
pub const MAGIC: [u8; 4] = *b"STEM";

/// Encodes `value` as a frame body.
pub fn encode_body<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))
}

/// Writes header, `body` and checksum.
pub fn write_frame(writer: &mut impl Write, body: &[u8]) -> IoResult<()> {
    let mut hasher = Hasher::new();
    hasher.update(body);
    let crc = hasher.finalize();

    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    writer.write_all(&(body.len() as u64).to_le_bytes())?;
    writer.write_all(body)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Reads and verifies a frame written by [`write_frame`].
///
/// # Errors
/// - Wrong magic or unsupported version
/// - Body longer than `max_len`
/// - Checksum mismatch (corruption detected)
/// - Body that does not deserialize
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read, max_len: u64) -> IoResult<T> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len > max_len {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("body size {len} exceeds maximum {max_len}"),
        ));
    }
    let len = usize::try_from(len)
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "body size does not fit in memory"))?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"),
        ));
    }

    serde_json::from_slice(&body)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}
