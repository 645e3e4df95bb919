//! Small helpers shared by the node service and the mount provider.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CsiError;
use crate::mount::{Mounter, is_corrupted_mount};

/// Run `fut`, failing with [`CsiError::Timeout`] if it does not finish within
/// `bound`. The future is dropped on expiry.
pub async fn do_with_timeout<T, F>(what: &str, bound: Duration, fut: F) -> Result<T, CsiError>
where
    F: Future<Output = Result<T, CsiError>>,
{
    match tokio::time::timeout(bound, fut).await {
        Ok(res) => res,
        Err(_) => Err(CsiError::Timeout {
            what: what.to_owned(),
            millis: u64::try_from(bound.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Whether `path` exists. A corrupted FUSE mount point counts as existing.
pub async fn path_exists(mounter: &dyn Mounter, path: &Path) -> Result<bool, CsiError> {
    match mounter.stat_is_dir(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) if is_corrupted_mount(&e) => Ok(true),
        Err(e) => Err(CsiError::Internal(format!("stat {}: {e}", path.display()))),
    }
}

/// Capacity figures of the filesystem containing a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// `statvfs(2)` on a blocking thread.
pub async fn disk_usage(path: &Path) -> Result<DiskUsage, CsiError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let stat = nix::sys::statvfs::statvfs(&path)
            .map_err(|e| CsiError::Internal(format!("statvfs {}: {e}", path.display())))?;
        let frsize = stat.fragment_size() as u64;
        Ok(DiskUsage {
            total_bytes: stat.blocks() as u64 * frsize,
            free_bytes: stat.blocks_available() as u64 * frsize,
            total_inodes: stat.files() as u64,
            free_inodes: stat.files_free() as u64,
        })
    })
    .await
    .map_err(CsiError::internal)?
}
