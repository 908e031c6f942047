//! MT-safe two-tier LRU manager over cached files.
//!
//! One long-lived [`FileCache`] per process. Entries live in a
//! [`LinkedHashMap`] whose order is the recency list: back = most recently
//! used, front = least recently used; promotion is a remove+insert re-link,
//! so the id→entry index and the recency list are one structure and can
//! never disagree.
//!
//! A single mutex guards all cache state for the whole duration of every
//! public operation, which also serializes page IO per cache instance —
//! a simplicity/correctness trade, not a throughput goal. Paths that
//! re-enter (resize growing through write, write freeing through eviction)
//! run as inner-state helpers under the already-held lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashlink::LinkedHashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::file::{File, delta};
use crate::cache::page::PageError;
use crate::cache::source::ByteSource;
use crate::config::CacheConfig;
use crate::io;
use crate::tree::DirectoryTree;

/// Marker dropped into the disk folder so later runs recognize it as ours.
///
/// Dangerous: changing this constant makes existing cache directories look
/// foreign and construction will refuse them.
const MARKER_FILE: &str = ".blobfs_cache";

/// Error describing why a disk cache folder cannot be used.
#[derive(Debug, Error)]
pub enum InvalidRootPathError {
    /// The path exists but isn't a directory.
    #[error("Disk cache path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The path is a non-empty directory with no cache marker, so its
    /// contents appear to come from something other than this cache.
    #[error("Disk cache path appears to hold data from a different source: {0}")]
    UnsafeCacheDir(PathBuf),

    /// An IO error occurred while validating the path.
    #[error("IO error while accessing disk cache path: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by cache write paths.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The request was malformed and nothing was mutated.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// Neither evicting the memory tier nor the disk tier made room.
    #[error("no space left for {need} bytes in either cache tier")]
    NoSpace {
        /// Bytes the rejected request asked for.
        need: u64,
    },

    /// A page or extent operation failed.
    #[error(transparent)]
    Page(#[from] PageError),
}

/// One entry's occupancy as seen at snapshot time.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    /// The file id.
    pub id: String,
    /// Logical file size.
    pub size: u64,
    /// Bytes held in memory.
    pub cached_size: u64,
    /// Bytes held in disk extents.
    pub disk_size: u64,
    /// Whether the file is pinned open.
    pub open: bool,
}

fn read_file(file: &RwLock<File>) -> RwLockReadGuard<'_, File> {
    file.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_file(file: &RwLock<File>) -> RwLockWriteGuard<'_, File> {
    file.write().unwrap_or_else(PoisonError::into_inner)
}

struct CacheInner {
    capacity: u64,
    disk_folder: PathBuf,
    disk_safe_threshold: u64,
    /// Recency list and id index in one: back = MRU, front = LRU.
    entries: LinkedHashMap<String, Arc<RwLock<File>>>,
    /// Sum of `cached_size` over all entries.
    mem_used: u64,
}

/// The two-tier LRU file content cache.
pub struct FileCache {
    inner: Mutex<CacheInner>,
}

impl FileCache {
    /// Create a cache with the given memory budget, spilling to
    /// `disk_folder` when a request demands fewer than
    /// `disk_safe_threshold` free bytes beyond its own length.
    ///
    /// The folder is created if missing. An existing folder must either be
    /// empty or carry the marker of a previous run; in the latter case its
    /// stale extents are swept, since the in-memory index always starts
    /// cold.
    pub fn new(
        capacity: u64,
        disk_folder: impl Into<PathBuf>,
        disk_safe_threshold: u64,
    ) -> Result<Self, InvalidRootPathError> {
        let disk_folder = disk_folder.into();
        let root = match std::fs::canonicalize(&disk_folder) {
            Ok(p) => {
                if !std::fs::metadata(&p)?.is_dir() {
                    return Err(InvalidRootPathError::NotADirectory(p));
                }
                let is_empty = std::fs::read_dir(&p)?.next().is_none();
                let marker_exists = p.join(MARKER_FILE).try_exists()?;
                if !(is_empty || marker_exists) {
                    return Err(InvalidRootPathError::UnsafeCacheDir(p));
                }
                io::remove_dir_contents(&p)?;
                p
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&disk_folder)?;
                std::fs::canonicalize(&disk_folder)?
            }
            Err(e) => return Err(e.into()),
        };

        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(root.join(MARKER_FILE))?;

        info!(
            disk_folder = %root.display(),
            capacity,
            disk_safe_threshold,
            "file cache initialized"
        );
        Ok(Self {
            inner: Mutex::new(CacheInner {
                capacity,
                disk_folder: root,
                disk_safe_threshold,
                entries: LinkedHashMap::new(),
                mem_used: 0,
            }),
        })
    }

    /// Create a cache from a [`CacheConfig`].
    pub fn from_config(config: &CacheConfig) -> Result<Self, InvalidRootPathError> {
        Self::new(
            config.capacity.as_u64(),
            config.disk_cache_directory.clone(),
            config.disk_safe_threshold.as_u64(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `id` is resident. Does not touch recency.
    pub fn has_file(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Logical size of `id`, or 0 when the file is not cached.
    pub fn file_size(&self, id: &str) -> u64 {
        self.lock()
            .entries
            .get(id)
            .map_or(0, |f| read_file(f).size())
    }

    /// Number of resident files.
    pub fn file_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Sum of memory-resident bytes across all files.
    pub fn memory_used(&self) -> u64 {
        self.lock().mem_used
    }

    /// The memory-tier byte budget.
    pub fn capacity(&self) -> u64 {
        self.lock().capacity
    }

    /// The folder spilled extents are written under.
    pub fn disk_folder(&self) -> PathBuf {
        self.lock().disk_folder.clone()
    }

    /// Whether the least-recently-used entry is pinned open. When true the
    /// next eviction pass is likely to stall at the tail.
    pub fn lru_is_open(&self) -> bool {
        let inner = self.lock();
        inner
            .entries
            .front()
            .is_some_and(|(_, f)| read_file(f).is_open())
    }

    /// Look up `id`, promoting it to most recently used.
    ///
    /// The returned handle stays valid after eviction (the file is simply
    /// cleared). Do not hold its lock across another cache call.
    pub fn find_file(&self, id: &str) -> Option<Arc<RwLock<File>>> {
        let mut inner = self.lock();
        if inner.entries.contains_key(id) {
            Some(inner.promote(id))
        } else {
            debug!(id, "file not in cache");
            None
        }
    }

    /// Fetch `id`, inserting an empty file at most-recently-used if absent.
    pub fn make_file(&self, id: &str) -> Arc<RwLock<File>> {
        let mut inner = self.lock();
        match inner.entries.get(id) {
            Some(file) => Arc::clone(file),
            None => inner.insert_empty(id),
        }
    }

    /// Admit `len` bytes of `src` at `offset` into `id`.
    ///
    /// Follows the admission protocol: make room in the memory tier by
    /// eviction, or fall back to disk backing when the disk tier has safe
    /// headroom. On success the directory tree node (when given and found)
    /// learns the grown size and the open flag. Returns the admitted byte
    /// count.
    pub fn write(
        &self,
        id: &str,
        offset: u64,
        len: usize,
        src: &mut dyn ByteSource,
        tree: Option<&dyn DirectoryTree>,
        opened: bool,
    ) -> Result<u64, WriteError> {
        self.lock().write(id, offset, len, src, tree, opened)
    }

    /// Drop `id` and all its bytes. Returns whether anything was removed.
    pub fn erase(&self, id: &str) -> bool {
        let mut inner = self.lock();
        if inner.entries.contains_key(id) {
            debug!(id, "erase cache");
            inner.erase_entry(id);
            true
        } else {
            debug!(id, "file not in cache; no remove");
            false
        }
    }

    /// Re-key `old_id` to `new_id`, evicting any file already cached under
    /// `new_id` and promoting the renamed entry to most recently used.
    /// Disk extents are physically relocated to the new derivation.
    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<(), PageError> {
        self.lock().rename(old_id, new_id)
    }

    /// Toggle the eviction pin for `id`, mirroring the flag to the tree
    /// node when one is found. Missing cache entries only skip the cache
    /// half, exactly like the tree half tolerates a missing node.
    pub fn set_open(&self, id: &str, open: bool, tree: Option<&dyn DirectoryTree>) {
        self.lock().set_open(id, open, tree);
    }

    /// Resize `id` to `new_size`.
    ///
    /// Growing writes a zero-filled hole through the regular admission
    /// path so the growth is budgeted; shrinking truncates. The tree node
    /// is updated only when the file ends up at exactly `new_size`.
    pub fn resize(
        &self,
        id: &str,
        new_size: u64,
        tree: Option<&dyn DirectoryTree>,
    ) -> Result<(), WriteError> {
        self.lock().resize(id, new_size, tree)
    }

    /// Try to bring `memory_used + need` within capacity by evicting from
    /// the least recently used end, sparing `pinned_id` and open files.
    /// Returns whether enough room was reached.
    pub fn free(&self, need: u64, pinned_id: &str) -> bool {
        self.lock().free(need, pinned_id)
    }

    /// Try to reach safe free disk space for `need` more bytes by dropping
    /// whole files from the least recently used end, sparing `pinned_id`
    /// and open files.
    pub fn free_disk(&self, need: u64, pinned_id: &str) -> bool {
        self.lock().free_disk(need, pinned_id)
    }

    /// Per-entry occupancy in recency order, most recently used first.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .rev()
            .map(|(id, f)| {
                let f = read_file(f);
                EntrySnapshot {
                    id: id.clone(),
                    size: f.size(),
                    cached_size: f.cached_size(),
                    disk_size: f.disk_size(),
                    open: f.is_open(),
                }
            })
            .collect()
    }
}

impl CacheInner {
    fn has_free_space(&self, need: u64) -> bool {
        self.mem_used.saturating_add(need) <= self.capacity
    }

    /// Re-link `id` to the most recently used end and return its handle.
    fn promote(&mut self, id: &str) -> Arc<RwLock<File>> {
        let file = self
            .entries
            .remove(id)
            .unwrap_or_else(|| unreachable!("promote of unknown id {id}"));
        self.entries.insert(id.to_owned(), Arc::clone(&file));
        file
    }

    /// Insert an empty file for `id` at the most recently used end.
    fn insert_empty(&mut self, id: &str) -> Arc<RwLock<File>> {
        let file = Arc::new(RwLock::new(File::new(id, self.disk_folder.clone())));
        self.entries.insert(id.to_owned(), Arc::clone(&file));
        file
    }

    /// Drop an entry, clear its file, and account the freed bytes.
    /// Returns `(freed_cached, freed_disk)`.
    fn erase_entry(&mut self, id: &str) -> (u64, u64) {
        let Some(file) = self.entries.remove(id) else {
            return (0, 0);
        };
        let mut file = write_file(&file);
        let (cached, disk) = (file.cached_size(), file.disk_size());
        self.mem_used = self.mem_used.saturating_sub(cached);
        file.clear();
        (cached, disk)
    }

    fn apply_cached_delta(&mut self, cached_delta: i64) {
        if cached_delta >= 0 {
            self.mem_used += cached_delta.unsigned_abs();
        } else {
            self.mem_used = self.mem_used.saturating_sub(cached_delta.unsigned_abs());
        }
    }

    fn write(
        &mut self,
        id: &str,
        offset: u64,
        len: usize,
        src: &mut dyn ByteSource,
        tree: Option<&dyn DirectoryTree>,
        opened: bool,
    ) -> Result<u64, WriteError> {
        if len == 0 {
            // Touch only: refresh recency, or register the id.
            if self.entries.contains_key(id) {
                self.promote(id);
            } else {
                self.insert_empty(id);
            }
            return Ok(0);
        }
        if id.is_empty() {
            error!("write cache with empty file id");
            return Err(WriteError::InvalidInput("empty file id"));
        }
        let end = offset
            .checked_add(len as u64)
            .ok_or(WriteError::InvalidInput("offset + len overflows"))?;
        let available = src.remaining().map_err(PageError::from)?;
        if len as u64 > available {
            error!(id, len, available, "write longer than its byte source");
            return Err(WriteError::InvalidInput("source shorter than write length"));
        }

        debug!(id, offset, len, "write cache");
        let file = self.prepare_write(id, len)?;
        // Sync the occupancy counter from observed sizes even when the
        // write fails partway: the file may already have shed or gained
        // cached bytes while carving.
        let (result, cached_before, cached_after) = {
            let mut guard = write_file(&file);
            let before = guard.cached_size();
            let result = guard.write(offset, len, src, opened);
            let after = guard.cached_size();
            (result, before, after)
        };
        self.apply_cached_delta(delta(cached_before, cached_after));
        let outcome = result?;

        if let Some(tree) = tree
            && let Some(node) = tree.find(id)
        {
            if end > node.file_size() {
                node.set_file_size(end);
            }
            node.set_file_open(opened);
        }
        Ok(outcome.admitted)
    }

    /// The admission ladder: memory as-is, memory after eviction, then
    /// disk backing behind the free-space demand. Promotes (or inserts)
    /// the entry and stamps its `use_disk` hint.
    fn prepare_write(&mut self, id: &str, len: usize) -> Result<Arc<RwLock<File>>, WriteError> {
        let need = len as u64;
        let fits_memory = self.has_free_space(need) || self.free(need, id);
        if !fits_memory {
            io::create_dir_if_not_exists(&self.disk_folder).map_err(|e| {
                error!(folder = %self.disk_folder.display(), error = %e, "unable to create disk cache folder");
                WriteError::Page(e.into())
            })?;
            let demand = need.saturating_add(self.disk_safe_threshold);
            if !io::is_safe_disk_space(&self.disk_folder, demand) && !self.free_disk(need, id) {
                error!(id, need, "no free space in memory or disk cache");
                return Err(WriteError::NoSpace { need });
            }
        }

        let file = if self.entries.contains_key(id) {
            self.promote(id)
        } else {
            self.insert_empty(id)
        };
        write_file(&file).set_use_disk(!fits_memory);
        Ok(file)
    }

    fn free(&mut self, need: u64, pinned_id: &str) -> bool {
        if need > self.capacity {
            debug!(
                need,
                capacity = self.capacity,
                "free request surpasses the whole cache capacity; doing nothing"
            );
            return false;
        }
        if self.has_free_space(need) {
            return true;
        }
        debug_assert!(
            !self.entries.is_empty(),
            "over budget with no entries to evict"
        );

        let mut freed_cached = 0u64;
        let mut freed_disk = 0u64;
        // Front-to-back walk is LRU to MRU. Keys are snapshotted so
        // removal never touches a live cursor.
        let candidates: Vec<String> = self.entries.keys().cloned().collect();
        for candidate in candidates {
            if self.has_free_space(need) {
                break;
            }
            if candidate == pinned_id {
                continue;
            }
            let open = match self.entries.get(&candidate) {
                Some(file) => read_file(file).is_open(),
                None => continue,
            };
            if open {
                continue;
            }
            let (cached, disk) = self.erase_entry(&candidate);
            freed_cached += cached;
            freed_disk += disk;
        }

        if freed_cached > 0 {
            info!(freed = freed_cached, pinned = pinned_id, "freed cached bytes");
        }
        if freed_disk > 0 {
            info!(freed = freed_disk, pinned = pinned_id, "freed disk bytes");
        }
        self.has_free_space(need)
    }

    fn free_disk(&mut self, need: u64, pinned_id: &str) -> bool {
        let demand = need.saturating_add(self.disk_safe_threshold);
        if io::is_safe_disk_space(&self.disk_folder, demand) {
            return true;
        }
        debug_assert!(
            !self.entries.is_empty(),
            "disk eviction attempted on an empty cache"
        );

        let mut freed_cached = 0u64;
        let mut freed_disk = 0u64;
        let candidates: Vec<String> = self.entries.keys().cloned().collect();
        for candidate in candidates {
            // Re-probe each step: clearing a file unlinks its extents, so
            // the answer moves under us.
            if io::is_safe_disk_space(&self.disk_folder, demand) {
                break;
            }
            if candidate == pinned_id {
                continue;
            }
            let open = match self.entries.get(&candidate) {
                Some(file) => read_file(file).is_open(),
                None => continue,
            };
            if open {
                continue;
            }
            let (cached, disk) = self.erase_entry(&candidate);
            freed_cached += cached;
            freed_disk += disk;
        }

        if freed_cached > 0 {
            info!(freed = freed_cached, pinned = pinned_id, "freed cached bytes");
        }
        if freed_disk > 0 {
            info!(freed = freed_disk, pinned = pinned_id, "freed disk bytes");
        }
        io::is_safe_disk_space(&self.disk_folder, demand)
    }

    fn rename(&mut self, old_id: &str, new_id: &str) -> Result<(), PageError> {
        if old_id == new_id {
            debug!(id = old_id, "rename to the same id; nothing to do");
            return Ok(());
        }
        if self.entries.contains_key(new_id) {
            warn!(id = new_id, "rename target already cached; evicting it");
            self.erase_entry(new_id);
        }
        let Some(file) = self.entries.remove(old_id) else {
            debug!(old_id, new_id, "file not in cache; no rename");
            return Ok(());
        };

        let relocated = write_file(&file).rename(new_id);
        // Renaming is itself an access: the re-keyed entry lands at MRU.
        self.entries.insert(new_id.to_owned(), file);
        debug!(old_id, new_id, "renamed file in cache");
        relocated
    }

    fn set_open(&mut self, id: &str, open: bool, tree: Option<&dyn DirectoryTree>) {
        match self.entries.get(id) {
            Some(file) => write_file(file).set_open(open),
            None => debug!(id, "file not in cache; no open flag to set"),
        }
        if let Some(tree) = tree
            && let Some(node) = tree.find(id)
        {
            node.set_file_open(open);
        }
    }

    fn resize(
        &mut self,
        id: &str,
        new_size: u64,
        tree: Option<&dyn DirectoryTree>,
    ) -> Result<(), WriteError> {
        let file = match self.entries.get(id) {
            Some(file) => Arc::clone(file),
            // Not cached yet, maybe because its content is empty.
            None => self.insert_empty(id),
        };
        let (old_size, old_cached, opened) = {
            let f = read_file(&file);
            (f.size(), f.cached_size(), f.is_open())
        };

        match new_size.cmp(&old_size) {
            std::cmp::Ordering::Equal => return Ok(()),
            std::cmp::Ordering::Greater => {
                let hole = new_size - old_size;
                debug!(id, offset = old_size, len = hole, "filling resize hole");
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "a hole past usize::MAX cannot be admitted anyway"
                )]
                let zeros = vec![0u8; hole as usize];
                let mut src: &[u8] = &zeros;
                self.write(id, old_size, zeros.len(), &mut src, tree, opened)?;
            }
            std::cmp::Ordering::Less => {
                let result = write_file(&file).resize_smaller(new_size);
                let new_cached = read_file(&file).cached_size();
                self.apply_cached_delta(delta(old_cached, new_cached));
                result?;
            }
        }

        let now = read_file(&file).size();
        if now == new_size {
            if let Some(tree) = tree
                && let Some(node) = tree.find(id)
            {
                node.set_file_size(new_size);
            }
        } else {
            warn!(
                id,
                old_size, new_size, actual = now,
                "file size does not match the requested resize"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn small_cache(capacity: u64) -> (tempfile::TempDir, FileCache) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(capacity, tmp.path().join("cache"), 0).unwrap();
        (tmp, cache)
    }

    fn write(cache: &FileCache, id: &str, offset: u64, data: &[u8]) -> Result<u64, WriteError> {
        let mut src: &[u8] = data;
        cache.write(id, offset, data.len(), &mut src, None, false)
    }

    #[test]
    fn construction_creates_folder_and_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("fresh");
        let _cache = FileCache::new(100, &dir, 0).unwrap();
        assert!(dir.join(MARKER_FILE).exists());
    }

    #[test]
    fn construction_rejects_foreign_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("unrelated"), b"data").unwrap();
        let err = FileCache::new(100, tmp.path(), 0);
        assert!(matches!(err, Err(InvalidRootPathError::UnsafeCacheDir(_))));
    }

    #[test]
    fn construction_sweeps_marked_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(MARKER_FILE), b"").unwrap();
        std::fs::write(tmp.path().join("stale.page"), b"old extent").unwrap();

        let _cache = FileCache::new(100, tmp.path(), 0).unwrap();
        assert!(
            !tmp.path().join("stale.page").exists(),
            "stale extents should be swept at startup"
        );
        assert!(tmp.path().join(MARKER_FILE).exists());
    }

    #[test]
    fn construction_rejects_file_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plain");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            FileCache::new(100, &path, 0),
            Err(InvalidRootPathError::NotADirectory(_))
        ));
    }

    #[test]
    fn empty_id_is_invalid_input() {
        let (_tmp, cache) = small_cache(100);
        assert!(matches!(
            write(&cache, "", 0, b"data"),
            Err(WriteError::InvalidInput(_))
        ));
        assert_eq!(cache.file_count(), 0, "failed write must not mutate");
    }

    #[test]
    fn short_source_is_invalid_input() {
        let (_tmp, cache) = small_cache(100);
        let mut src: &[u8] = b"ab";
        let res = cache.write("a", 0, 5, &mut src, None, false);
        assert!(matches!(res, Err(WriteError::InvalidInput(_))));
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn zero_length_write_registers_id() {
        let (_tmp, cache) = small_cache(100);
        assert_eq!(write(&cache, "a", 0, b"").unwrap(), 0);
        assert!(cache.has_file("a"));
        assert_eq!(cache.memory_used(), 0);
    }

    #[test]
    fn free_refuses_unservable_request() {
        let (_tmp, cache) = small_cache(100);
        write(&cache, "a", 0, &[b'x'; 40]).unwrap();
        assert!(!cache.free(101, ""), "need beyond capacity is unservable");
        assert!(cache.has_file("a"), "refused free must not evict");
    }

    #[test]
    fn lru_is_open_reflects_tail_pin() {
        let (_tmp, cache) = small_cache(100);
        write(&cache, "a", 0, &[b'x'; 10]).unwrap();
        write(&cache, "b", 0, &[b'x'; 10]).unwrap();
        assert!(!cache.lru_is_open());

        cache.set_open("a", true, None);
        assert!(cache.lru_is_open(), "oldest entry 'a' is now pinned");
    }
}
