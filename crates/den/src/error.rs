//! Error and Result types for Den archive operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for Den operations.
pub type Result<T> = std::result::Result<T, DenError>;

/// The error type for archive operations.
#[derive(Debug, Error)]
pub enum DenError {
    /// Operation attempted on an editor, table or task in the wrong state
    /// (after commit, rollback or dispose, or while another editor is live).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Index or offset outside the bounds of a fixed-size buffer.
    #[error("Out of range: index {index} exceeds length {len}")]
    OutOfRange {
        /// Requested index.
        index: u64,
        /// Valid length.
        len: u64,
    },

    /// A configuration or metadata record was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Encoded node or directory bytes could not be decoded.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Invalid magic bytes in an archive file header.
    #[error("Invalid magic bytes: expected DENH, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported archive file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DenError {
    /// Shorthand for [`DenError::InvalidState`].
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Returns true if this is an [`DenError::InvalidState`] error.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}
