//! External mount process supervision.
//!
//! A [`MountBackend`] owns the processes that make the distributed
//! filesystem visible at session mount points, and forwards quota requests
//! to the same tool.  [`ProcessMountBackend`] drives a mount binary with the
//! command-line shape
//!
//! ```text
//! <binary> mount <metaurl> <mount_point> [-o opt1,opt2]
//! <binary> quota set <metaurl> --path <path> --capacity <GiB>
//! ```
//!
//! with backend credentials passed through the environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::error::CsiError;
use crate::mount::Mounter;
use crate::settings::MountSettings;

const GIB: u64 = 1 << 30;

/// Starts, stops and configures mount sessions.
#[async_trait]
pub trait MountBackend: Send + Sync {
    /// Start a mount for `settings` at `mount_point` and return once the
    /// mount point is live. Returns the process id when one is tracked.
    ///
    /// Callers bound this with a startup timeout; dropping the future must
    /// not leave a process behind.
    async fn mount(
        &self,
        settings: &MountSettings,
        mount_point: &Path,
    ) -> Result<Option<u32>, CsiError>;

    /// Stop the mount at `mount_point`. Absent mounts are not an error.
    async fn unmount(&self, mount_point: &Path) -> Result<(), CsiError>;

    /// Limit the capacity of `path` (filesystem-absolute) to `limit_bytes`.
    async fn set_quota(
        &self,
        settings: &MountSettings,
        path: &str,
        limit_bytes: u64,
    ) -> Result<(), CsiError>;
}

/// Kills a child that never became ready, including when the startup future
/// is dropped by a timeout or a cancelled caller.
struct StartupGuard(Option<Child>);

impl Drop for StartupGuard {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut()
            && let Err(e) = child.start_kill()
        {
            debug!(error = %e, "mount process already gone");
        }
    }
}

/// [`MountBackend`] that spawns one long-running mount process per session.
pub struct ProcessMountBackend {
    binary: PathBuf,
    mounter: Arc<dyn Mounter>,
    poll_interval: Duration,
    exit_timeout: Duration,
    children: Mutex<HashMap<PathBuf, Child>>,
}

impl ProcessMountBackend {
    /// * `binary` — the filesystem's mount tool
    /// * `mounter` — used to detect when the mount point becomes live
    pub fn new(binary: impl Into<PathBuf>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            binary: binary.into(),
            mounter,
            poll_interval: Duration::from_millis(100),
            exit_timeout: Duration::from_secs(3),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = exit_timeout;
        self
    }

    fn mount_command(&self, settings: &MountSettings, mount_point: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("mount").arg(&settings.source).arg(mount_point);
        if !settings.options.is_empty() {
            cmd.arg("-o").arg(settings.options.join(","));
        }
        cmd.envs(settings.backend_env())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }

    fn quota_command(&self, settings: &MountSettings, path: &str, limit_bytes: u64) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["quota", "set"])
            .arg(&settings.source)
            .args(["--path", path])
            .arg("--capacity")
            .arg(limit_bytes.div_ceil(GIB).to_string())
            .envs(settings.backend_env())
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl MountBackend for ProcessMountBackend {
    #[instrument(skip_all, fields(fs = %settings.filesystem_name, mount_point = %mount_point.display()))]
    async fn mount(
        &self,
        settings: &MountSettings,
        mount_point: &Path,
    ) -> Result<Option<u32>, CsiError> {
        let failed = |reason: String| CsiError::MountFailed {
            path: mount_point.display().to_string(),
            reason,
        };

        let child = self
            .mount_command(settings, mount_point)
            .spawn()
            .map_err(|e| failed(format!("spawn {}: {e}", self.binary.display())))?;
        let mut guard = StartupGuard(Some(child));

        loop {
            let Some(child) = guard.0.as_mut() else {
                return Err(failed("mount process handle lost".into()));
            };
            if let Some(status) = child
                .try_wait()
                .map_err(|e| failed(format!("check mount process: {e}")))?
            {
                guard.0 = None;
                return Err(failed(format!(
                    "mount process exited prematurely with {status}"
                )));
            }
            if self.mounter.is_mountpoint(mount_point).await? {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let Some(child) = guard.0.take() else {
            return Err(failed("mount process handle lost".into()));
        };
        let pid = child.id();
        self.children.lock().insert(mount_point.to_path_buf(), child);
        info!(?pid, "mount process ready");
        Ok(pid)
    }

    #[instrument(skip_all, fields(mount_point = %mount_point.display()))]
    async fn unmount(&self, mount_point: &Path) -> Result<(), CsiError> {
        if self.mounter.is_mountpoint(mount_point).await? {
            self.mounter.unmount(mount_point).await?;
        }

        let child = self.children.lock().remove(mount_point);
        let Some(mut child) = child else {
            debug!("no tracked mount process");
            return Ok(());
        };

        // Unmounting ends the FUSE session, so the process normally exits on
        // its own; only stragglers get killed.
        match tokio::time::timeout(self.exit_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "mount process exited"),
            Ok(Err(e)) => warn!(error = %e, "waiting for mount process failed"),
            Err(_) => {
                warn!(timeout = ?self.exit_timeout, "mount process did not exit, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "kill mount process failed");
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, settings), fields(fs = %settings.filesystem_name))]
    async fn set_quota(
        &self,
        settings: &MountSettings,
        path: &str,
        limit_bytes: u64,
    ) -> Result<(), CsiError> {
        let output = self
            .quota_command(settings, path, limit_bytes)
            .output()
            .await
            .map_err(|e| CsiError::BackendError(format!("spawn quota command: {e}")))?;
        if !output.status.success() {
            return Err(CsiError::BackendError(format!(
                "quota set {path} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(path, limit_bytes, "quota applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings;
    use crate::testing::FakeMounter;

    fn settings() -> MountSettings {
        let secrets = HashMap::from([
            ("name".to_owned(), "shared".to_owned()),
            ("metaurl".to_owned(), "redis://meta/1".to_owned()),
            ("access-key".to_owned(), "ak".to_owned()),
        ]);
        settings::resolve(
            &"pv-1".into(),
            &secrets,
            &HashMap::new(),
            &["cache-size=100".into(), "ro".into()],
        )
        .unwrap()
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn mount_command_shape() {
        let backend = ProcessMountBackend::new("/usr/local/bin/juicefs", FakeMounter::new());
        let cmd = backend.mount_command(&settings(), Path::new("/var/lib/rkcsi/mnt/s"));
        assert_eq!(
            args(&cmd),
            vec![
                "mount",
                "redis://meta/1",
                "/var/lib/rkcsi/mnt/s",
                "-o",
                "cache-size=100,ro"
            ]
        );
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(envs.iter().any(|(k, _)| *k == "ACCESS_KEY"));
    }

    #[test]
    fn quota_is_rounded_up_to_gib() {
        let backend = ProcessMountBackend::new("juicefs", FakeMounter::new());
        let cmd = backend.quota_command(&settings(), "/pv-1", GIB + 1);
        assert_eq!(
            args(&cmd),
            vec![
                "quota",
                "set",
                "redis://meta/1",
                "--path",
                "/pv-1",
                "--capacity",
                "2"
            ]
        );
    }

    #[tokio::test]
    async fn premature_exit_fails_the_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = ProcessMountBackend::new("/bin/false", FakeMounter::new());
        let err = backend.mount(&settings(), tmp.path()).await.unwrap_err();
        assert!(matches!(err, CsiError::MountFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn quota_failure_is_a_backend_error() {
        let backend = ProcessMountBackend::new("/bin/false", FakeMounter::new());
        let err = backend
            .set_quota(&settings(), "/pv-1", GIB)
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::BackendError(_)));

        let backend = ProcessMountBackend::new("/bin/true", FakeMounter::new());
        backend.set_quota(&settings(), "/pv-1", GIB).await.unwrap();
    }

    #[tokio::test]
    async fn unmount_without_process_is_noop() {
        let backend = ProcessMountBackend::new("/bin/true", FakeMounter::new());
        backend
            .unmount(Path::new("/var/lib/rkcsi/mnt/none"))
            .await
            .unwrap();
    }
}
