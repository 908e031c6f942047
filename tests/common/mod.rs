#![allow(dead_code, missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use blobfs_cache::FileCache;
use blobfs_cache::tree::{DirectoryTree, TreeNode};

/// A directory-tree node recording the size and open flag the cache writes
/// through.
#[derive(Default)]
pub struct MockNode {
    size: AtomicU64,
    open: AtomicBool,
}

impl MockNode {
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

impl TreeNode for MockNode {
    fn file_size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn set_file_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    fn set_file_open(&self, open: bool) {
        self.open.store(open, Ordering::Relaxed);
    }
}

/// An in-memory directory tree with explicitly registered nodes.
#[derive(Default)]
pub struct MockTree {
    nodes: Mutex<HashMap<String, Arc<MockNode>>>,
}

impl MockTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node for `id` and return it for later inspection.
    pub fn add_node(&self, id: &str) -> Arc<MockNode> {
        let node = Arc::new(MockNode::default());
        self.nodes
            .lock()
            .unwrap()
            .insert(id.to_owned(), Arc::clone(&node));
        node
    }
}

impl DirectoryTree for MockTree {
    fn find(&self, id: &str) -> Option<Arc<dyn TreeNode>> {
        let node = self.nodes.lock().unwrap().get(id).cloned()?;
        Some(node)
    }
}

/// A cache over a fresh tempdir. Keep the tempdir alive for the cache's
/// lifetime.
pub fn cache_with_capacity(capacity: u64) -> (tempfile::TempDir, FileCache) {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::new(capacity, tmp.path().join("cache"), 0).unwrap();
    (tmp, cache)
}

/// Write `data` to `id` at `offset` with no tree and no pin.
pub fn write_buf(cache: &FileCache, id: &str, offset: u64, data: &[u8]) -> u64 {
    let mut src: &[u8] = data;
    cache
        .write(id, offset, data.len(), &mut src, None, false)
        .unwrap()
}

/// Read `len` bytes at `offset` from `id`, asserting full coverage.
pub fn read_buf(cache: &FileCache, id: &str, offset: u64, len: usize) -> Vec<u8> {
    let file = cache.find_file(id).expect("file should be cached");
    let guard = file.read().unwrap();
    let outcome = guard.read(offset, len).unwrap();
    assert!(
        outcome.holes.is_empty(),
        "expected full coverage, got holes: {:?}",
        outcome.holes
    );
    let mut out = Vec::with_capacity(len);
    for (_, chunk) in outcome.chunks {
        out.extend_from_slice(&chunk);
    }
    out
}

/// Assert that `memory_used` equals the sum of per-file cached sizes.
pub fn assert_accounting(cache: &FileCache) {
    let snapshot = cache.snapshot();
    let sum: u64 = snapshot.iter().map(|e| e.cached_size).sum();
    assert_eq!(
        cache.memory_used(),
        sum,
        "memory_used must equal the sum of cached sizes; snapshot: {snapshot:?}"
    );
}
