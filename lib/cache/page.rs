//! One contiguous byte extent of a cached file.
//!
//! A page is backed either by an in-memory buffer or by a dedicated extent
//! file on disk. The backing may change over the page's lifetime (spill
//! under memory pressure, load on access) but its position and length only
//! change through the owning file's split and truncate paths.

use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tracing::{trace, warn};

use crate::cache::source::ByteSource;

/// Chunk size used when draining a byte source straight to a disk extent.
const COPY_CHUNK: usize = 64 * 1024;

/// Errors surfaced by page operations.
#[derive(Debug, Error)]
pub enum PageError {
    /// The requested range falls outside the page.
    #[error("range [{off}..{off}+{len}) outside page [{page_off}..{page_off}+{page_len})")]
    OutOfRange {
        /// Requested start offset (absolute, within the file).
        off: u64,
        /// Requested length.
        len: usize,
        /// The page's start offset.
        page_off: u64,
        /// The page's length.
        page_len: usize,
    },

    /// An IO error while touching the page's disk extent.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

enum PageStore {
    Memory(Vec<u8>),
    Disk { path: PathBuf },
}

/// A contiguous byte range of one cached file.
pub struct Page {
    offset: u64,
    len: usize,
    store: PageStore,
}

impl Page {
    /// Build a memory-backed page from an owned buffer.
    pub(crate) fn from_buffer(offset: u64, data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            offset,
            len,
            store: PageStore::Memory(data),
        }
    }

    /// Build a disk-backed page by streaming `len` bytes from `src` into a
    /// fresh extent file at `path`.
    ///
    /// A half-written extent left by a failure is unlinked before the error
    /// is surfaced, so bookkeeping never sees it.
    pub(crate) fn from_source_on_disk(
        offset: u64,
        len: usize,
        src: &mut dyn ByteSource,
        path: PathBuf,
    ) -> Result<Self, PageError> {
        match write_extent(&path, len, src) {
            Ok(()) => {
                trace!(path = %path.display(), offset, len, "wrote disk extent");
                Ok(Self {
                    offset,
                    len,
                    store: PageStore::Disk { path },
                })
            }
            Err(e) => {
                remove_extent(&path);
                Err(e.into())
            }
        }
    }

    /// Start offset of this page within its file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of this page in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the page holds no bytes. Owning files never keep such pages.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last offset covered by this page.
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }

    /// Whether the page currently lives in memory.
    pub fn is_resident(&self) -> bool {
        matches!(self.store, PageStore::Memory(_))
    }

    /// Path of the disk extent, when the page is disk-backed.
    pub fn extent_path(&self) -> Option<&Path> {
        match &self.store {
            PageStore::Memory(_) => None,
            PageStore::Disk { path } => Some(path),
        }
    }

    fn check_range(&self, off: u64, len: usize) -> Result<(), PageError> {
        if off < self.offset || off.saturating_add(len as u64) > self.end() {
            return Err(PageError::OutOfRange {
                off,
                len,
                page_off: self.offset,
                page_len: self.len,
            });
        }
        Ok(())
    }

    /// Read `len` bytes starting at absolute offset `off`.
    ///
    /// The range must lie entirely within the page.
    pub fn read(&self, off: u64, len: usize) -> Result<Bytes, PageError> {
        self.check_range(off, len)?;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "check_range bounds the difference by the page length"
        )]
        let rel = (off - self.offset) as usize;
        match &self.store {
            PageStore::Memory(buf) => Ok(Bytes::copy_from_slice(&buf[rel..rel + len])),
            PageStore::Disk { path } => {
                let mut file = std::fs::File::open(path)?;
                file.seek(SeekFrom::Start(rel as u64))?;
                let mut out = vec![0u8; len];
                file.read_exact(&mut out)?;
                Ok(Bytes::from(out))
            }
        }
    }

    /// Overwrite part of the page in place.
    ///
    /// The range must lie entirely within the page; the page's position,
    /// length, and backing are unchanged.
    pub fn write(&mut self, off: u64, data: &[u8]) -> Result<(), PageError> {
        self.check_range(off, data.len())?;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "check_range bounds the difference by the page length"
        )]
        let rel = (off - self.offset) as usize;
        match &mut self.store {
            PageStore::Memory(buf) => {
                buf[rel..rel + data.len()].copy_from_slice(data);
                Ok(())
            }
            PageStore::Disk { path } => {
                let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
                file.seek(SeekFrom::Start(rel as u64))?;
                file.write_all(data)?;
                Ok(())
            }
        }
    }

    /// Migrate a memory-backed page to a disk extent at `path`.
    ///
    /// Idempotent when already on disk. On failure the page keeps its
    /// memory backing and no extent is left behind.
    pub fn spill(&mut self, path: PathBuf) -> Result<(), PageError> {
        let PageStore::Memory(buf) = &self.store else {
            return Ok(());
        };
        let mut src: &[u8] = buf;
        if let Err(e) = write_extent(&path, buf.len(), &mut src) {
            remove_extent(&path);
            return Err(e.into());
        }
        trace!(path = %path.display(), offset = self.offset, len = self.len, "spilled page");
        self.store = PageStore::Disk { path };
        Ok(())
    }

    /// Migrate a disk-backed page back into memory, unlinking its extent.
    ///
    /// Idempotent when already resident. On a read failure the page keeps
    /// its disk backing.
    pub fn load(&mut self) -> Result<(), PageError> {
        let PageStore::Disk { path } = &self.store else {
            return Ok(());
        };
        let mut buf = vec![0u8; self.len];
        let mut file = std::fs::File::open(path)?;
        file.read_exact(&mut buf)?;
        remove_extent(path);
        self.store = PageStore::Memory(buf);
        Ok(())
    }

    /// Shrink the page to its first `new_len` bytes.
    ///
    /// `new_len` must be positive and no larger than the current length.
    pub(crate) fn truncate(&mut self, new_len: usize) -> Result<(), PageError> {
        debug_assert!(
            new_len > 0 && new_len <= self.len,
            "truncate({new_len}) outside (0, {}]",
            self.len
        );
        if new_len >= self.len {
            return Ok(());
        }
        match &mut self.store {
            PageStore::Memory(buf) => buf.truncate(new_len),
            PageStore::Disk { path } => {
                let file = std::fs::OpenOptions::new().write(true).open(&*path)?;
                file.set_len(new_len as u64)?;
            }
        }
        self.len = new_len;
        Ok(())
    }

    /// Move the disk extent to `new_path` (rename support). No-op for
    /// memory-backed pages.
    pub(crate) fn relocate(&mut self, new_path: PathBuf) -> Result<(), PageError> {
        if let PageStore::Disk { path } = &mut self.store {
            std::fs::rename(&*path, &new_path)?;
            *path = new_path;
        }
        Ok(())
    }

    /// Release the page's backing store. Memory is simply dropped; a disk
    /// extent is unlinked best-effort.
    pub(crate) fn discard(&mut self) {
        if let PageStore::Disk { path } = &self.store {
            remove_extent(path);
        }
        self.store = PageStore::Memory(Vec::new());
        self.len = 0;
    }
}

/// Stream `len` bytes from `src` into a fresh file at `path`.
fn write_extent(path: &Path, len: usize, src: &mut dyn ByteSource) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut chunk = vec![0u8; COPY_CHUNK.min(len.max(1))];
    let mut left = len;
    while left > 0 {
        let take = left.min(chunk.len());
        src.read_into(&mut chunk[..take])?;
        file.write_all(&chunk[..take])?;
        left -= take;
    }
    Ok(())
}

/// Unlink an extent, tolerating a file that is already gone.
fn remove_extent(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to unlink page extent");
        }
    }
}
