//! Arena-backed in-memory medium.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::debug;

use crate::error::{DenError, Result};
use crate::medium::{DiskMedium, FileHeader, PageArena};

/// A [`DiskMedium`] that keeps every byte in a [`PageArena`].
///
/// Flushing only moves the committed length forward; nothing is persisted
/// beyond the lifetime of the value.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    arena: PageArena,
    header: Option<FileHeader>,
    committed_length: u64,
}

impl MemoryMedium {
    /// Creates an empty medium with default-sized pages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty medium with a custom arena page size.
    pub fn with_page_size(page_size: usize) -> Result<Self> {
        Ok(Self {
            arena: PageArena::with_page_size(page_size)?,
            header: None,
            committed_length: 0,
        })
    }

    /// Length covered by the last flush.
    pub fn committed_length(&self) -> u64 {
        self.committed_length
    }
}

impl DiskMedium for MemoryMedium {
    type Session<'a> = ArenaCursor<'a>;

    fn create_io_session(&mut self) -> Result<ArenaCursor<'_>> {
        Ok(ArenaCursor {
            arena: &mut self.arena,
            pos: 0,
        })
    }

    fn length(&self) -> u64 {
        self.arena.len()
    }

    fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    fn flush_with_header(&mut self, header: &FileHeader) -> Result<()> {
        if header.data_length > self.arena.len() {
            return Err(DenError::invalid_state(format!(
                "header covers {} bytes but medium holds {}",
                header.data_length,
                self.arena.len()
            )));
        }
        self.committed_length = header.data_length;
        self.header = Some(*header);
        debug!(
            sequence = header.sequence,
            length = header.data_length,
            "Flushed memory medium"
        );
        Ok(())
    }

    fn rollback_changes(&mut self) -> Result<()> {
        debug!(
            staged = self.arena.len().saturating_sub(self.committed_length),
            "Rolling back memory medium"
        );
        self.arena.resize(self.committed_length);
        Ok(())
    }
}

/// Read/write cursor over a [`PageArena`]. Writes past the end grow it.
#[derive(Debug)]
pub struct ArenaCursor<'a> {
    arena: &'a mut PageArena,
    pos: u64,
}

impl Read for ArenaCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.arena.len().saturating_sub(self.pos);
        let n = (buf.len() as u64).min(available) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.arena
            .read_at(self.pos, &mut buf[..n])
            .map_err(io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for ArenaCursor<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.pos + buf.len() as u64;
        if end > self.arena.len() {
            self.arena.resize(end);
        }
        self.arena
            .write_at(self.pos, buf)
            .map_err(io::Error::other)?;
        self.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ArenaCursor<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.arena.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of medium",
            )),
        }
    }
}
