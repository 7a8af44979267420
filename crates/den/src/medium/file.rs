//! File-backed medium.
//!
//! # File layout
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────────────────┐
//! │ Header slot 0│ Header slot 1│ Data (append-only)             │
//! │ 128 bytes    │ 128 bytes    │ nodes, directories, ...        │
//! └──────────────┴──────────────┴────────────────────────────────┘
//! ```
//!
//! Commit `n` writes its header into slot `n % 2`, so a torn header write
//! leaves the previous commit's header intact. On open the newest header that
//! validates and fits inside the file wins; bytes past its `data_length` are
//! an unfinished commit and are truncated.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{DenError, Result};
use crate::medium::{DiskMedium, FileHeader, SyncMode, HEADER_SIZE};

/// Bytes reserved for each header slot.
pub const HEADER_SLOT_SIZE: u64 = 128;

/// Offset of the first data byte.
pub const DATA_START: u64 = 2 * HEADER_SLOT_SIZE;

/// A [`DiskMedium`] stored in a single file.
#[derive(Debug)]
pub struct FileMedium {
    file: File,
    path: PathBuf,
    sync_mode: SyncMode,
    header: Option<FileHeader>,
    committed_length: u64,
}

impl FileMedium {
    /// Opens or creates the medium at `path`.
    ///
    /// A new file gets an empty header region. An existing file is recovered
    /// to its newest valid header and truncated to that header's length.
    ///
    /// # Errors
    ///
    /// Returns `DenError::Io` on file errors.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut medium = Self {
            file,
            path,
            sync_mode,
            header: None,
            committed_length: DATA_START,
        };

        if file_len < DATA_START {
            debug!(path = %medium.path.display(), "Initializing new medium");
            medium.file.set_len(DATA_START)?;
            medium.sync()?;
            return Ok(medium);
        }

        medium.header = medium.recover_header(file_len);
        if let Some(header) = &medium.header {
            medium.committed_length = header.data_length;
            info!(
                path = %medium.path.display(),
                sequence = header.sequence,
                length = header.data_length,
                "Recovered medium header"
            );
        }
        if file_len > medium.committed_length {
            warn!(
                path = %medium.path.display(),
                discarded = file_len - medium.committed_length,
                "Truncating uncommitted tail"
            );
            medium.file.set_len(medium.committed_length)?;
            medium.sync()?;
        }
        Ok(medium)
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync policy in effect.
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Length covered by the last flush.
    pub fn committed_length(&self) -> u64 {
        self.committed_length
    }

    fn recover_header(&self, file_len: u64) -> Option<FileHeader> {
        let mut best: Option<FileHeader> = None;
        for slot in 0..2u64 {
            let mut buf = [0u8; HEADER_SIZE];
            let mut reader = &self.file;
            let read = reader
                .seek(SeekFrom::Start(slot * HEADER_SLOT_SIZE))
                .and_then(|_| reader.read_exact(&mut buf));
            if let Err(err) = read {
                warn!(slot, error = %err, "Failed to read header slot");
                continue;
            }
            let header = match FileHeader::from_bytes(&buf) {
                Ok(header) => header,
                Err(err) => {
                    // An all-zero slot is an unused slot, not damage.
                    if buf.iter().any(|&b| b != 0) {
                        warn!(slot, error = %err, "Ignoring invalid header slot");
                    }
                    continue;
                }
            };
            if header.data_length < DATA_START || header.data_length > file_len {
                warn!(
                    slot,
                    length = header.data_length,
                    file_len,
                    "Ignoring header that does not fit the file"
                );
                continue;
            }
            if best.map_or(true, |b| header.sequence > b.sequence) {
                best = Some(header);
            }
        }
        best
    }

    fn sync(&self) -> Result<()> {
        match self.sync_mode {
            SyncMode::Fsync => self.file.sync_all()?,
            SyncMode::Fdatasync => self.file.sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }
}

impl DiskMedium for FileMedium {
    type Session<'a> = &'a File;

    fn create_io_session(&mut self) -> Result<&File> {
        let mut session = &self.file;
        session.seek(SeekFrom::Start(DATA_START))?;
        Ok(session)
    }

    fn length(&self) -> u64 {
        self.file
            .metadata()
            .map(|m| m.len())
            .unwrap_or(self.committed_length)
    }

    fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    fn flush_with_header(&mut self, header: &FileHeader) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        if header.data_length < DATA_START || header.data_length > file_len {
            return Err(DenError::invalid_state(format!(
                "header covers {} bytes but file holds {}",
                header.data_length, file_len
            )));
        }

        // Data must be durable before the header that references it.
        self.sync()?;
        let slot = header.sequence % 2;
        let mut session = &self.file;
        session.seek(SeekFrom::Start(slot * HEADER_SLOT_SIZE))?;
        header.write_to(&mut session)?;
        session.flush()?;
        self.sync()?;

        self.committed_length = header.data_length;
        self.header = Some(*header);
        debug!(
            path = %self.path.display(),
            sequence = header.sequence,
            slot,
            length = header.data_length,
            "Flushed medium"
        );
        Ok(())
    }

    fn rollback_changes(&mut self) -> Result<()> {
        debug!(
            path = %self.path.display(),
            length = self.committed_length,
            "Rolling back medium"
        );
        self.file.set_len(self.committed_length)?;
        Ok(())
    }
}
