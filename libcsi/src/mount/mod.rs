//! Local mount primitives and the mount provider built on top of them.
//!
//! * [`Mounter`] — bind / unmount / mount-point detection on this host.
//! * [`process`] — the external mount process that makes the distributed
//!   filesystem visible at a session mount point.
//! * [`provider`] — session sharing, refcounting and bind bookkeeping.

pub mod process;
pub mod provider;

use std::io;
use std::path::Path;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use tracing::debug;

use crate::error::CsiError;

pub use process::{MountBackend, ProcessMountBackend};
pub use provider::{MountProvider, MountSession, Released};

/// Host-level mount operations.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Whether `path` is currently a mount point.
    async fn is_mountpoint(&self, path: &Path) -> Result<bool, CsiError>;

    /// Bind-mount `source` at `target`, optionally read-only.
    async fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), CsiError>;

    /// Unmount `target`.
    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;

    /// `stat(2)` on `path`, reporting whether it is a directory.
    async fn stat_is_dir(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::metadata(path).await.map(|m| m.is_dir())
    }
}

/// `true` for errors a dead FUSE mount point produces on `stat`.
pub fn is_corrupted_mount(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENOTCONN | Errno::ESTALE | Errno::EIO | Errno::EHOSTDOWN)
    )
}

/// Undo the octal escapes `/proc/self/mounts` uses for whitespace and `\`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &bytes[i + 1..i + 4];
            if oct.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = oct
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(b) = u8::try_from(value) {
                    out.push(b);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `path` appears as a mount point in a mount table.
///
/// Format: `<device> <mountpoint> <fstype> <options> <dump> <pass>`
fn mount_table_contains(table: &str, path: &Path) -> bool {
    table.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|mp| Path::new(&unescape_mount_field(mp)) == path)
    })
}

/// [`Mounter`] backed by `mount(2)` / `umount2(2)` and `/proc/self/mounts`.
#[derive(Debug, Default, Clone)]
pub struct LinuxMounter;

#[async_trait]
impl Mounter for LinuxMounter {
    async fn is_mountpoint(&self, path: &Path) -> Result<bool, CsiError> {
        let contents = tokio::fs::read_to_string("/proc/self/mounts")
            .await
            .map_err(|e| CsiError::Internal(format!("read /proc/self/mounts: {e}")))?;
        Ok(mount_table_contains(&contents, path))
    }

    async fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), CsiError> {
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| CsiError::MountFailed {
            path: target.display().to_string(),
            reason: format!("bind {}: {e}", source.display()),
        })?;

        // MS_RDONLY only takes effect on a bind remount.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: target.display().to_string(),
                reason: format!("remount read-only: {e}"),
            })?;
        }
        debug!(source = %source.display(), target = %target.display(), read_only, "bind mounted");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        let res = match nix::mount::umount2(target, MntFlags::empty()) {
            // Busy FUSE sessions are detached instead of failing the caller.
            Err(Errno::EBUSY) => nix::mount::umount2(target, MntFlags::MNT_DETACH),
            other => other,
        };
        res.map_err(|e| CsiError::UnmountFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid 0 0
shared:/ /var/lib/rkcsi/mnt/shared-0123 fuse.juicefs rw,relatime 0 0
shared:/ /var/lib/rkl/pods/a\\040b/volumes/pv fuse.juicefs rw 0 0
";

    #[test]
    fn finds_plain_mount_points() {
        assert!(mount_table_contains(
            TABLE,
            Path::new("/var/lib/rkcsi/mnt/shared-0123")
        ));
        assert!(!mount_table_contains(TABLE, Path::new("/var/lib/rkcsi/mnt")));
    }

    #[test]
    fn decodes_escaped_whitespace() {
        assert!(mount_table_contains(
            TABLE,
            Path::new("/var/lib/rkl/pods/a b/volumes/pv")
        ));
    }

    #[test]
    fn corrupted_mount_errors() {
        assert!(is_corrupted_mount(&io::Error::from_raw_os_error(
            Errno::ENOTCONN as i32
        )));
        assert!(!is_corrupted_mount(&io::Error::from(
            io::ErrorKind::NotFound
        )));
    }
}
