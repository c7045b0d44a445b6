//! Shared-memory path bookkeeping.
//!
//! Cross-process coordination lives in a companion region under
//! `/dev/shm`; its path is derived from the file's identity and pinned to
//! the file through an extended attribute so every process opening the
//! file finds the same region. Only the naming and the xattr round-trip
//! are handled here — the region itself belongs to the bookkeeping layer.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use ulayfs_error::Result;

/// Extended attribute holding the shared-memory path.
pub const SHM_XATTR_NAME: &str = "user.ulayfs.shm_path";

/// Derive the canonical shared-memory path for a file:
/// `/dev/shm/ulayfs_<inode_hex_16>_<ctime_ns_shifted_hex_13>`.
#[must_use]
pub fn derive_shm_path(ino: u64, ctime_sec: i64, ctime_nsec: i64) -> PathBuf {
    let ctime_ns = ctime_sec as u64 * 1_000_000_000 + ctime_nsec as u64;
    PathBuf::from(format!("/dev/shm/ulayfs_{ino:016x}_{:013x}", ctime_ns >> 3))
}

/// Resolve the shared-memory path for an open file: read the xattr if
/// present, otherwise derive a fresh path and pin it to the file.
pub fn init_shm_path(file: &File) -> Result<PathBuf> {
    if let Some(value) = xattr::FileExt::get_xattr(file, SHM_XATTR_NAME)? {
        return Ok(PathBuf::from(String::from_utf8_lossy(&value).into_owned()));
    }

    let stat = file.metadata()?;
    let path = derive_shm_path(stat.ino(), stat.ctime(), stat.ctime_nsec());
    xattr::FileExt::set_xattr(
        file,
        SHM_XATTR_NAME,
        path.as_os_str().as_encoded_bytes(),
    )?;
    Ok(path)
}
