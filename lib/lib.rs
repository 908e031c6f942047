//! blobfs content cache library.
//!
//! The cache mediates between user-facing read/write operations and a remote
//! object store: recently-touched file contents are held in memory, spilled
//! to a local disk directory under memory pressure, and whole files are
//! evicted least-recently-used first to keep total occupancy within budget.

/// Caching primitives for blobfs.
pub mod cache;
/// Cache configuration settings.
pub mod config;
pub mod io;
/// The directory-tree seam the cache writes file metadata through.
pub mod tree;

pub use cache::fcache::FileCache;
pub use cache::file::File;
pub use cache::page::Page;
pub use cache::source::ByteSource;
