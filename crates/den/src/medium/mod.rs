//! Disk medium contract and its implementations.
//!
//! A medium is a flat, append-friendly byte region plus a structural
//! [`FileHeader`]. Writers stage bytes through an I/O session; nothing staged
//! is considered durable until [`DiskMedium::flush_with_header`] returns.
//! [`DiskMedium::rollback_changes`] discards everything staged since the last
//! flush. Flush and rollback calls are serialized by the owning table.
//!
//! Two implementations are provided:
//!
//! - [`MemoryMedium`]: pages in a [`PageArena`], nothing survives the process.
//! - [`FileMedium`]: a single file with two alternating header slots.

pub mod arena;
pub mod file;
pub mod header;
pub mod memory;

use std::io::{Read, Seek, Write};

pub use arena::{PageAddress, PageArena, DEFAULT_PAGE_SIZE};
pub use file::FileMedium;
pub use header::{FileHeader, HEADER_MAGIC, HEADER_SIZE, HEADER_VERSION};
pub use memory::MemoryMedium;

use crate::error::Result;

/// A reusable read/write cursor bound to a medium.
pub trait IoSession: Read + Write + Seek {}

impl<T: Read + Write + Seek> IoSession for T {}

/// File sync policy applied at hard commit boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `fsync` data and metadata (default, highest durability).
    #[default]
    Fsync,
    /// `fdatasync`, skipping metadata that is not needed to read the data.
    Fdatasync,
    /// No sync; only for tests and scratch tables.
    None,
}

/// Commit/rollback/flush contract over a physical byte store.
pub trait DiskMedium: Send {
    /// Cursor type handed out by [`create_io_session`](Self::create_io_session).
    type Session<'a>: IoSession
    where
        Self: 'a;

    /// Opens a read/write cursor. Offsets are absolute medium positions; new
    /// data is appended at `SeekFrom::End(0)`.
    fn create_io_session(&mut self) -> Result<Self::Session<'_>>;

    /// Approximate bytes in use, including staged data. Advisory only.
    fn length(&self) -> u64;

    /// Header of the last successful flush, if any.
    fn header(&self) -> Option<&FileHeader>;

    /// Durably persists staged data together with `header`.
    fn flush_with_header(&mut self, header: &FileHeader) -> Result<()>;

    /// Discards data staged since the last flush.
    fn rollback_changes(&mut self) -> Result<()>;
}
