//! Seam to the externally owned directory tree.
//!
//! The cache never owns the tree — a reference is passed per call, and the
//! cache writes file size and open-state through it so that both views stay
//! consistent. Every tree interaction tolerates an absent tree or an absent
//! node; the cache degrades to a no-op in that case.

use std::sync::Arc;

/// Metadata held by the directory tree for a single file.
///
/// Implementations are expected to be internally synchronized: the cache
/// calls setters through a shared reference while holding its own lock.
pub trait TreeNode: Send + Sync {
    /// Logical file size as currently recorded in the tree.
    fn file_size(&self) -> u64;

    /// Record a new logical file size.
    fn set_file_size(&self, size: u64);

    /// Record whether the file currently has an open handle.
    fn set_file_open(&self, open: bool);
}

/// Lookup surface of the directory tree.
pub trait DirectoryTree: Send + Sync {
    /// Find the node for `id`, if the tree knows the file.
    fn find(&self, id: &str) -> Option<Arc<dyn TreeNode>>;
}
