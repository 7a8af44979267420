//! Structural header persisted at every hard commit.
//!
//! # Layout (100 bytes, little-endian)
//!
//! ```text
//! ┌───────────────┬─────────┬──────────┬──────────┬─────────────┐
//! │ Magic "DENH"  │ Version │ Reserved │ Sequence │ Data length │
//! │ 4 bytes       │ 2 bytes │ 2 bytes  │ 8 bytes  │ 8 bytes     │
//! ├───────────────┴──┬──────┴──────────┴──┬───────┴─────────────┤
//! │ Directory offset │ Directory len/CRC  │ Record count        │
//! │ 8 bytes          │ 4 + 4 bytes        │ 8 bytes             │
//! ├──────────────────┴───────┬────────────┴─────────┬───────────┤
//! │ First key (fixed form)   │ Last key (fixed form)│ CRC32     │
//! │ 24 bytes                 │ 24 bytes             │ 4 bytes   │
//! └──────────────────────────┴──────────────────────┴───────────┘
//! ```
//!
//! The trailing CRC32 covers the first 96 bytes.

use std::io::{Read, Write};

use crate::codec::{PointKey, KEY_SIZE};
use crate::error::{DenError, Result};

/// Magic bytes identifying a den header.
pub const HEADER_MAGIC: [u8; 4] = *b"DENH";

/// Current header format version.
pub const HEADER_VERSION: u16 = 1;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 100;

const CRC_OFFSET: usize = HEADER_SIZE - 4;

/// Commit metadata written by `DiskMedium::flush_with_header`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Monotonic commit sequence; the newest valid header wins on open.
    pub sequence: u64,
    /// Medium length covered by this commit.
    pub data_length: u64,
    /// Offset of the node directory.
    pub directory_offset: u64,
    /// Length of the node directory in bytes.
    pub directory_length: u32,
    /// CRC32 of the node directory bytes.
    pub directory_crc: u32,
    /// Total records in the table.
    pub record_count: u64,
    /// Smallest key in the table (meaningless if `record_count == 0`).
    pub first_key: PointKey,
    /// Largest key in the table (meaningless if `record_count == 0`).
    pub last_key: PointKey,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            sequence: 0,
            data_length: 0,
            directory_offset: 0,
            directory_length: 0,
            directory_crc: 0,
            record_count: 0,
            first_key: PointKey::MAX,
            last_key: PointKey::MIN,
        }
    }
}

impl FileHeader {
    /// Serializes the header, including its checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&HEADER_MAGIC);
        buf[4..6].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        // 6..8 reserved
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_length.to_le_bytes());
        buf[24..32].copy_from_slice(&self.directory_offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.directory_length.to_le_bytes());
        buf[36..40].copy_from_slice(&self.directory_crc.to_le_bytes());
        buf[40..48].copy_from_slice(&self.record_count.to_le_bytes());
        buf[48..48 + KEY_SIZE].copy_from_slice(&self.first_key.to_fixed());
        buf[72..72 + KEY_SIZE].copy_from_slice(&self.last_key.to_fixed());

        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses and validates a serialized header.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidMagic`, `DenError::UnsupportedVersion` or
    /// `DenError::ChecksumMismatch` for a header that fails validation, and
    /// `DenError::OutOfRange` if `buf` is shorter than [`HEADER_SIZE`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(DenError::OutOfRange {
                index: HEADER_SIZE as u64 - 1,
                len: buf.len() as u64,
            });
        }
        let buf = &buf[..HEADER_SIZE];

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != HEADER_MAGIC {
            return Err(DenError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > HEADER_VERSION {
            return Err(DenError::UnsupportedVersion(version));
        }

        let expected = le_u32(buf, CRC_OFFSET);
        let actual = crc32fast::hash(&buf[..CRC_OFFSET]);
        if expected != actual {
            return Err(DenError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            sequence: le_u64(buf, 8),
            data_length: le_u64(buf, 16),
            directory_offset: le_u64(buf, 24),
            directory_length: le_u32(buf, 32),
            directory_crc: le_u32(buf, 36),
            record_count: le_u64(buf, 40),
            first_key: PointKey::from_fixed(&buf[48..48 + KEY_SIZE])?,
            last_key: PointKey::from_fixed(&buf[72..72 + KEY_SIZE])?,
        })
    }

    /// Writes the header to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Reads and validates a header from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }

    /// Returns the first/last key bounds, or `None` for an empty table.
    pub fn key_bounds(&self) -> Option<(PointKey, PointKey)> {
        (self.record_count > 0).then_some((self.first_key, self.last_key))
    }
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}
