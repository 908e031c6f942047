//! Disk-side IO utilities for the cache.

use std::path::Path;

use tracing::warn;

/// Create `path` (and any missing parents) if it does not already exist.
///
/// Returns `Ok(())` when the directory already existed.
pub fn create_dir_if_not_exists(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
}

/// Number of bytes an unprivileged process can still write under `path`.
pub fn free_disk_bytes(path: &Path) -> std::io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    #[allow(clippy::allow_attributes)]
    #[allow(clippy::useless_conversion)]
    Ok(u64::from(stat.blocks_available()) * u64::from(stat.fragment_size()))
}

/// Whether `path`'s filesystem has at least `need` bytes available.
///
/// A probe failure is treated as "not safe" — the caller falls back to its
/// no-space path rather than writing blind.
pub fn is_safe_disk_space(path: &Path, need: u64) -> bool {
    match free_disk_bytes(path) {
        Ok(free) => free >= need,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to probe free disk space");
            false
        }
    }
}

/// Remove all files and directories in the given directory, but not the
/// directory itself.
pub fn remove_dir_contents(path: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(path)? {
        let path = entry?.path();
        if std::fs::metadata(&path)?.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}
