//! Paged byte arena.
//!
//! A growable byte region made of fixed-size pages addressed by
//! `(page index, offset)`. The arena owns every page exclusively; pages are
//! released when the arena shrinks or is dropped.

use tracing::debug;

use crate::error::{DenError, Result};

/// Default page size (64 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Location of a byte inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAddress {
    /// Page index.
    pub page: usize,
    /// Offset inside the page.
    pub offset: usize,
}

/// Growable byte region backed by fixed-size pages.
#[derive(Debug)]
pub struct PageArena {
    pages: Vec<Box<[u8]>>,
    page_size: usize,
    shift: u32,
    mask: u64,
    len: u64,
}

impl Default for PageArena {
    fn default() -> Self {
        Self::new()
    }
}

impl PageArena {
    /// Creates an empty arena with [`DEFAULT_PAGE_SIZE`] pages.
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            shift: DEFAULT_PAGE_SIZE.trailing_zeros(),
            mask: DEFAULT_PAGE_SIZE as u64 - 1,
            len: 0,
        }
    }

    /// Creates an empty arena with a custom page size.
    ///
    /// # Errors
    ///
    /// Returns `DenError::InvalidState` unless `page_size` is a power of two.
    pub fn with_page_size(page_size: usize) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(DenError::invalid_state(format!(
                "page size {page_size} is not a power of two"
            )));
        }
        Ok(Self {
            pages: Vec::new(),
            page_size,
            shift: page_size.trailing_zeros(),
            mask: page_size as u64 - 1,
            len: 0,
        })
    }

    /// Logical length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the arena holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of allocated pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Translates a byte position into a page address.
    ///
    /// # Errors
    ///
    /// Returns `DenError::OutOfRange` if `pos >= len`.
    pub fn address(&self, pos: u64) -> Result<PageAddress> {
        self.check(pos, 1)?;
        Ok(self.address_unchecked(pos))
    }

    /// Reads one byte.
    pub fn get(&self, pos: u64) -> Result<u8> {
        let addr = self.address(pos)?;
        Ok(self.pages[addr.page][addr.offset])
    }

    /// Writes one byte.
    pub fn set(&mut self, pos: u64, byte: u8) -> Result<()> {
        let addr = self.address(pos)?;
        self.pages[addr.page][addr.offset] = byte;
        Ok(())
    }

    /// Fills `buf` from `pos`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::OutOfRange` if the range extends past `len`.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.check(pos, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let addr = self.address_unchecked(pos + done as u64);
            let n = (self.page_size - addr.offset).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&self.pages[addr.page][addr.offset..addr.offset + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `data` into the arena at `pos`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::OutOfRange` if the range extends past `len`; call
    /// [`resize`](Self::resize) first to grow.
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.check(pos, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let addr = self.address_unchecked(pos + done as u64);
            let n = (self.page_size - addr.offset).min(data.len() - done);
            self.pages[addr.page][addr.offset..addr.offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Grows or shrinks the logical length, allocating zeroed pages or
    /// releasing pages no longer covered.
    pub fn resize(&mut self, new_len: u64) {
        let needed = new_len.div_ceil(self.page_size as u64) as usize;
        if needed > self.pages.len() {
            let size = self.page_size;
            self.pages
                .resize_with(needed, || vec![0u8; size].into_boxed_slice());
        } else if needed < self.pages.len() {
            debug!(
                released = self.pages.len() - needed,
                "Releasing arena pages"
            );
            self.pages.truncate(needed);
        }
        if new_len < self.len {
            // Zero the tail of the last kept page so regrowth reads zeros.
            let tail_start = new_len;
            let tail_end = (needed as u64 * self.page_size as u64).min(self.len);
            for pos in tail_start..tail_end {
                let addr = self.address_unchecked(pos);
                self.pages[addr.page][addr.offset] = 0;
            }
        }
        self.len = new_len;
    }

    fn address_unchecked(&self, pos: u64) -> PageAddress {
        PageAddress {
            page: (pos >> self.shift) as usize,
            offset: (pos & self.mask) as usize,
        }
    }

    fn check(&self, pos: u64, count: usize) -> Result<()> {
        let end = pos.checked_add(count as u64).ok_or(DenError::OutOfRange {
            index: u64::MAX,
            len: self.len,
        })?;
        if end > self.len {
            return Err(DenError::OutOfRange {
                index: end.saturating_sub(1).max(pos),
                len: self.len,
            });
        }
        Ok(())
    }
}
