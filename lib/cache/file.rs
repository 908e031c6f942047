//! A single cached file: ordered, non-overlapping pages plus bookkeeping.
//!
//! A `File` covers parts of `[0, size)` with [`Page`]s keyed by offset.
//! Gaps are permitted and reported to readers as holes; the caller fetches
//! those from the origin store. Writes carve overlapping pages around the
//! written range so the invariants (no overlap, `size` covers every page)
//! hold after every operation.

use std::collections::BTreeMap;
use std::hash::Hasher as _;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rustc_hash::FxHasher;
use tracing::warn;

use crate::cache::page::{Page, PageError};
use crate::cache::source::ByteSource;

/// Longest readable id tail embedded in an extent file name.
const EXTENT_TAIL_MAX: usize = 48;

/// Result of a [`File::read`]: covered data plus uncovered holes, both in
/// ascending offset order.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// `(offset, data)` for each covered sub-range.
    pub chunks: Vec<(u64, Bytes)>,
    /// `(offset, len)` for each sub-range no page covers.
    pub holes: Vec<(u64, u64)>,
}

/// Result of a [`File::write`], reported upward so the cache can maintain
/// its occupancy counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteOutcome {
    /// Bytes actually admitted.
    pub admitted: u64,
    /// Signed change of memory-resident bytes.
    pub cached_delta: i64,
    /// Signed change of disk-extent bytes.
    pub disk_delta: i64,
}

/// A sub-range carved off an existing page, awaiting reinsertion.
struct Remnant {
    offset: u64,
    data: Vec<u8>,
    resident: bool,
}

/// One cached file's pages and bookkeeping.
pub struct File {
    id: String,
    pages: BTreeMap<u64, Page>,
    size: u64,
    cached_size: u64,
    disk_size: u64,
    open: bool,
    use_disk: bool,
    disk_folder: PathBuf,
}

impl File {
    /// Create an empty file for `id`, deriving extent paths under
    /// `disk_folder`.
    pub fn new(id: impl Into<String>, disk_folder: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            pages: BTreeMap::new(),
            size: 0,
            cached_size: 0,
            disk_size: 0,
            open: false,
            use_disk: false,
            disk_folder: disk_folder.into(),
        }
    }

    /// The caller-supplied identity, typically the object key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Logical size: the write/resize high-water mark.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes of this file currently held in memory.
    pub fn cached_size(&self) -> u64 {
        self.cached_size
    }

    /// Bytes of this file currently held in disk extents.
    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    /// Whether an external holder has an open handle (pins against
    /// eviction).
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Set the eviction pin.
    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    /// Whether new pages default to disk backing.
    pub fn use_disk(&self) -> bool {
        self.use_disk
    }

    /// Direct subsequent writes to disk (or back to memory).
    pub fn set_use_disk(&mut self, use_disk: bool) {
        self.use_disk = use_disk;
    }

    /// `(offset, end)` of every page, ascending. Diagnostic surface.
    pub fn page_ranges(&self) -> Vec<(u64, u64)> {
        self.pages.values().map(|p| (p.offset(), p.end())).collect()
    }

    /// Paths of all disk extents currently owned by this file.
    pub fn extent_paths(&self) -> Vec<PathBuf> {
        self.pages
            .values()
            .filter_map(|p| p.extent_path().map(Path::to_path_buf))
            .collect()
    }

    /// Read up to `len` bytes at `offset`.
    ///
    /// Covered sub-ranges come back as data chunks; uncovered sub-ranges as
    /// holes for the caller to fetch from the origin store.
    pub fn read(&self, offset: u64, len: usize) -> Result<ReadOutcome, PageError> {
        let mut outcome = ReadOutcome::default();
        if len == 0 {
            return Ok(outcome);
        }
        let end = offset.saturating_add(len as u64);
        // Start from the last page at or before `offset`; it may reach in.
        let start_key = self
            .pages
            .range(..=offset)
            .next_back()
            .map_or(offset, |(k, _)| *k);

        let mut cursor = offset;
        for page in self.pages.range(start_key..end).map(|(_, p)| p) {
            if page.end() <= cursor {
                continue;
            }
            if page.offset() > cursor {
                outcome.holes.push((cursor, page.offset() - cursor));
                cursor = page.offset();
            }
            let chunk_end = page.end().min(end);
            #[expect(
                clippy::cast_possible_truncation,
                reason = "chunk length is bounded by the requested usize len"
            )]
            let take = (chunk_end - cursor) as usize;
            outcome.chunks.push((cursor, page.read(cursor, take)?));
            cursor = chunk_end;
        }
        if cursor < end {
            outcome.holes.push((cursor, end - cursor));
        }
        Ok(outcome)
    }

    /// Admit `len` bytes at `offset` from `src`, setting the open pin to
    /// `opened`.
    ///
    /// Overlapping pages are carved around the written range (remnants keep
    /// their backing); the written range becomes one new page backed per
    /// the `use_disk` hint. On failure before anything is committed the
    /// file is unchanged; a failed extent write after carving leaves the
    /// written range as a hole with consistent bookkeeping.
    pub fn write(
        &mut self,
        offset: u64,
        len: usize,
        src: &mut dyn ByteSource,
        opened: bool,
    ) -> Result<WriteOutcome, PageError> {
        self.open = opened;
        if len == 0 {
            return Ok(WriteOutcome::default());
        }
        let (cached_before, disk_before) = (self.cached_size, self.disk_size);

        let mut payload = vec![0u8; len];
        src.read_into(&mut payload)?;

        let end = offset + len as u64;
        let remnants = self.carve_out(offset, end)?;
        self.restore_remnants(remnants);

        if self.use_disk {
            let path = extent_path(&self.disk_folder, &self.id, offset);
            let page = {
                let mut buf: &[u8] = &payload;
                Page::from_source_on_disk(offset, len, &mut buf, path)?
            };
            self.pages.insert(offset, page);
            self.disk_size += len as u64;
        } else {
            self.pages.insert(offset, Page::from_buffer(offset, payload));
            self.cached_size += len as u64;
        }

        if end > self.size {
            self.size = end;
        }
        debug_assert!(
            self.cached_size <= self.size,
            "cached bytes exceed logical size for {}",
            self.id
        );

        Ok(WriteOutcome {
            admitted: len as u64,
            cached_delta: delta(cached_before, self.cached_size),
            disk_delta: delta(disk_before, self.disk_size),
        })
    }

    /// Truncate to `new_size`: drop pages wholly past the cut, shrink a
    /// straddling page, lower `size`.
    pub fn resize_smaller(&mut self, new_size: u64) -> Result<(), PageError> {
        debug_assert!(
            new_size < self.size,
            "resize_smaller({new_size}) called with size {}",
            self.size
        );
        if new_size >= self.size {
            warn!(id = %self.id, new_size, size = self.size, "ignoring non-shrinking resize");
            return Ok(());
        }

        let doomed: Vec<u64> = self.pages.range(new_size..).map(|(k, _)| *k).collect();
        for key in doomed {
            if let Some(mut page) = self.pages.remove(&key) {
                self.forget_page_bytes(&page);
                page.discard();
            }
        }

        if new_size > 0
            && let Some((&key, page)) = self.pages.range_mut(..new_size).next_back()
            && page.end() > new_size
        {
            #[expect(
                clippy::cast_possible_truncation,
                reason = "the kept prefix is no longer than the page's usize length"
            )]
            let keep = (new_size - key) as usize;
            let shed = (page.len() - keep) as u64;
            page.truncate(keep)?;
            if page.is_resident() {
                self.cached_size -= shed;
            } else {
                self.disk_size -= shed;
            }
        }

        self.size = new_size;
        Ok(())
    }

    /// Re-key the file and physically relocate every disk extent to the
    /// path derived from `new_id`.
    ///
    /// Relocation is attempted for every extent; a page whose move failed
    /// keeps serving reads from its old path, and the first error is
    /// surfaced after the sweep.
    pub fn rename(&mut self, new_id: &str) -> Result<(), PageError> {
        if new_id == self.id {
            return Ok(());
        }
        let old_id = std::mem::replace(&mut self.id, new_id.to_owned());
        let mut first_err = None;
        for page in self.pages.values_mut() {
            if page.is_resident() {
                continue;
            }
            let target = extent_path(&self.disk_folder, &self.id, page.offset());
            if let Err(e) = page.relocate(target) {
                warn!(
                    old_id = %old_id,
                    new_id = %self.id,
                    offset = page.offset(),
                    error = %e,
                    "failed to relocate page extent"
                );
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Drop every page, unlink every extent, zero all counters.
    pub fn clear(&mut self) {
        for page in self.pages.values_mut() {
            page.discard();
        }
        self.pages.clear();
        self.size = 0;
        self.cached_size = 0;
        self.disk_size = 0;
    }

    fn forget_page_bytes(&mut self, page: &Page) {
        if page.is_resident() {
            self.cached_size -= page.len() as u64;
        } else {
            self.disk_size -= page.len() as u64;
        }
    }

    /// Remove every page overlapping `[lo, hi)`, returning the sub-ranges
    /// that stick out on either side.
    ///
    /// The read phase runs before any mutation, so a failure here leaves
    /// the file untouched.
    fn carve_out(&mut self, lo: u64, hi: u64) -> Result<Vec<Remnant>, PageError> {
        let overlapping: Vec<u64> = self
            .pages
            .range(..hi)
            .filter(|(_, p)| p.end() > lo)
            .map(|(k, _)| *k)
            .collect();

        let mut remnants = Vec::new();
        for &key in &overlapping {
            let page = self
                .pages
                .get(&key)
                .unwrap_or_else(|| unreachable!("page {key} vanished during carve"));
            if page.offset() < lo {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "remnant length is bounded by the page's usize length"
                )]
                let len = (lo - page.offset()) as usize;
                remnants.push(Remnant {
                    offset: page.offset(),
                    data: page.read(page.offset(), len)?.to_vec(),
                    resident: page.is_resident(),
                });
            }
            if page.end() > hi {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "remnant length is bounded by the page's usize length"
                )]
                let len = (page.end() - hi) as usize;
                remnants.push(Remnant {
                    offset: hi,
                    data: page.read(hi, len)?.to_vec(),
                    resident: page.is_resident(),
                });
            }
        }

        for key in overlapping {
            if let Some(mut page) = self.pages.remove(&key) {
                self.forget_page_bytes(&page);
                page.discard();
            }
        }
        Ok(remnants)
    }

    /// Reinsert carved remnants, preserving each one's original backing.
    /// A remnant whose extent write fails stays in memory instead of being
    /// dropped.
    fn restore_remnants(&mut self, remnants: Vec<Remnant>) {
        for r in remnants {
            let len = r.data.len() as u64;
            if r.resident {
                self.pages.insert(r.offset, Page::from_buffer(r.offset, r.data));
                self.cached_size += len;
                continue;
            }
            let path = extent_path(&self.disk_folder, &self.id, r.offset);
            let rebuilt = {
                let mut buf: &[u8] = &r.data;
                Page::from_source_on_disk(r.offset, r.data.len(), &mut buf, path)
            };
            match rebuilt {
                Ok(page) => {
                    self.pages.insert(r.offset, page);
                    self.disk_size += len;
                }
                Err(e) => {
                    warn!(
                        id = %self.id,
                        offset = r.offset,
                        error = %e,
                        "failed to re-extent split remnant; keeping it in memory"
                    );
                    self.pages.insert(r.offset, Page::from_buffer(r.offset, r.data));
                    self.cached_size += len;
                }
            }
        }
    }
}

#[expect(
    clippy::cast_possible_wrap,
    reason = "cache occupancy is far below i64::MAX"
)]
pub(crate) fn delta(before: u64, after: u64) -> i64 {
    after as i64 - before as i64
}

fn id_digest(id: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(id.as_bytes());
    hasher.finish()
}

fn sanitized_tail(id: &str) -> String {
    let tail = id.rsplit('/').next().unwrap_or(id);
    let mut out: String = tail
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(EXTENT_TAIL_MAX);
    out
}

/// Deterministic extent path for (`id`, `offset`) under `folder`.
///
/// The digest disambiguates ids that sanitize identically; the tail keeps
/// the folder debuggable.
pub(crate) fn extent_path(folder: &Path, id: &str, offset: u64) -> PathBuf {
    folder.join(format!(
        "{:016x}-{}@{offset}.page",
        id_digest(id),
        sanitized_tail(id)
    ))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn mem_file(tmp: &tempfile::TempDir) -> File {
        File::new("bucket/key.bin", tmp.path())
    }

    fn write_buf(file: &mut File, offset: u64, data: &[u8]) -> WriteOutcome {
        let mut src: &[u8] = data;
        file.write(offset, data.len(), &mut src, false).unwrap()
    }

    fn read_all(file: &File, offset: u64, len: usize) -> Vec<u8> {
        let outcome = file.read(offset, len).unwrap();
        assert!(outcome.holes.is_empty(), "unexpected holes: {:?}", outcome.holes);
        let mut out = Vec::new();
        for (_, chunk) in outcome.chunks {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        let outcome = write_buf(&mut file, 0, b"hello world");

        assert_eq!(outcome.admitted, 11);
        assert_eq!(outcome.cached_delta, 11);
        assert_eq!(outcome.disk_delta, 0);
        assert_eq!(file.size(), 11);
        assert_eq!(file.cached_size(), 11);
        assert_eq!(read_all(&file, 0, 11), b"hello world");
    }

    #[test]
    fn read_reports_holes_around_pages() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        write_buf(&mut file, 10, b"abcd");

        let outcome = file.read(0, 30).unwrap();
        assert_eq!(outcome.holes, vec![(0, 10), (14, 16)]);
        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.chunks[0].0, 10);
        assert_eq!(&outcome.chunks[0].1[..], b"abcd");
    }

    #[test]
    fn overlapping_write_carves_remnants() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        write_buf(&mut file, 0, b"aaaaaaaaaaaaaaaaaaaa"); // [0, 20)
        write_buf(&mut file, 5, b"bbbbbbbbbb"); // [5, 15)

        assert_eq!(file.size(), 20);
        assert_eq!(file.cached_size(), 20);
        assert_eq!(read_all(&file, 0, 20), b"aaaaabbbbbbbbbbaaaaa");

        // No overlaps and full coverage of [0, 20).
        let ranges = file.page_ranges();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "pages overlap: {ranges:?}");
        }
    }

    #[test]
    fn extending_overlap_write_grows_size() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        write_buf(&mut file, 0, &[b'x'; 20]);
        write_buf(&mut file, 10, &[b'y'; 20]);

        assert_eq!(file.size(), 30);
        assert_eq!(file.cached_size(), 30);
        assert_eq!(read_all(&file, 0, 30).len(), 30);
    }

    #[test]
    fn disk_write_counts_disk_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        file.set_use_disk(true);
        let outcome = write_buf(&mut file, 0, b"spilled");

        assert_eq!(outcome.cached_delta, 0);
        assert_eq!(outcome.disk_delta, 7);
        assert_eq!(file.cached_size(), 0);
        assert_eq!(file.disk_size(), 7);
        assert_eq!(file.extent_paths().len(), 1);
        assert_eq!(read_all(&file, 0, 7), b"spilled");
    }

    #[test]
    fn spilled_overwrite_of_memory_reports_negative_cached_delta() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        write_buf(&mut file, 0, &[b'm'; 10]);

        file.set_use_disk(true);
        let outcome = write_buf(&mut file, 0, &[b'd'; 10]);
        assert_eq!(outcome.cached_delta, -10);
        assert_eq!(outcome.disk_delta, 10);
        assert_eq!(file.cached_size(), 0);
    }

    #[test]
    fn disk_remnants_keep_disk_backing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        file.set_use_disk(true);
        write_buf(&mut file, 0, b"0123456789"); // disk [0, 10)
        file.set_use_disk(false);
        write_buf(&mut file, 3, b"XXX"); // memory [3, 6)

        assert_eq!(read_all(&file, 0, 10), b"012XXX6789");
        assert_eq!(file.cached_size(), 3);
        assert_eq!(file.disk_size(), 7);
        assert_eq!(
            file.extent_paths().len(),
            2,
            "both disk remnants should own extents"
        );
    }

    #[test]
    fn resize_smaller_truncates_straddling_page() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        write_buf(&mut file, 0, &[b'a'; 10]);
        write_buf(&mut file, 20, &[b'b'; 10]);

        file.resize_smaller(5).unwrap();
        assert_eq!(file.size(), 5);
        assert_eq!(file.cached_size(), 5);
        assert_eq!(file.page_ranges(), vec![(0, 5)]);
    }

    #[test]
    fn resize_smaller_to_zero_clears_pages() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        write_buf(&mut file, 0, &[b'a'; 10]);

        file.resize_smaller(0).unwrap();
        assert_eq!(file.size(), 0);
        assert_eq!(file.cached_size(), 0);
        assert!(file.page_ranges().is_empty());
    }

    #[test]
    fn rename_relocates_extents() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        file.set_use_disk(true);
        write_buf(&mut file, 0, b"movable");
        let old_paths = file.extent_paths();

        file.rename("bucket/renamed.bin").unwrap();
        let new_paths = file.extent_paths();

        assert_eq!(file.id(), "bucket/renamed.bin");
        assert_ne!(old_paths, new_paths);
        assert!(!old_paths[0].exists(), "old extent should be gone");
        assert!(new_paths[0].exists(), "new extent should exist");
        assert_eq!(read_all(&file, 0, 7), b"movable");
    }

    #[test]
    fn clear_unlinks_extents_and_zeroes_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        file.set_use_disk(true);
        write_buf(&mut file, 0, b"gone soon");
        let paths = file.extent_paths();

        file.clear();
        assert_eq!(file.size(), 0);
        assert_eq!(file.cached_size(), 0);
        assert_eq!(file.disk_size(), 0);
        assert!(!paths[0].exists());
    }

    #[test]
    fn zero_length_write_only_sets_open() {
        let tmp = tempfile::tempdir().unwrap();
        let mut file = mem_file(&tmp);
        let mut src: &[u8] = b"";
        let outcome = file.write(0, 0, &mut src, true).unwrap();

        assert_eq!(outcome.admitted, 0);
        assert!(file.is_open());
        assert_eq!(file.size(), 0);
    }

    #[test]
    fn extent_paths_differ_for_ids_with_same_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let a = extent_path(tmp.path(), "x/key", 0);
        let b = extent_path(tmp.path(), "y/key", 0);
        assert_ne!(a, b, "digest must disambiguate identical tails");
    }
}
