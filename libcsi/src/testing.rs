//! In-memory stand-ins for the host, the mount tool and the cluster store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::cluster::{ClusterClient, ClusterError, PersistentVolume};
use crate::config::NodeConfig;
use crate::error::CsiError;
use crate::mount::{MountBackend, Mounter};
use crate::settings::MountSettings;

pub fn test_config(root: &Path) -> NodeConfig {
    NodeConfig {
        mount_root: root.join("mnt"),
        mount_binary: PathBuf::from("/bin/true"),
        startup_timeout: Duration::from_secs(5),
        check_timeout: Duration::from_millis(200),
        teardown_grace: Duration::ZERO,
        ..NodeConfig::default()
    }
}

/// Mount table kept in memory.
#[derive(Default)]
pub struct FakeMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    /// `read_only` flag of every bind, by target.
    binds: Mutex<HashMap<PathBuf, bool>>,
    /// Errors `stat` reports until the path is unmounted.
    stat_errors: Mutex<HashMap<PathBuf, Errno>>,
    unmounted: Mutex<Vec<PathBuf>>,
    hang_stat: AtomicBool,
    bind_calls: AtomicUsize,
    fail_bind: AtomicBool,
    fail_unmount: AtomicBool,
    hang: AtomicBool,
}

impl FakeMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_mounted(&self, path: &Path) {
        self.mounted.lock().insert(path.to_path_buf());
    }

    /// Drop `path` from the table, as if its mount died. Returns whether it
    /// was mounted.
    pub fn forget(&self, path: &Path) -> bool {
        self.mounted.lock().remove(path)
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.mounted.lock().contains(path)
    }

    /// Whether the last bind at `target` asked for read-only.
    pub fn bound_read_only(&self, target: &Path) -> Option<bool> {
        self.binds.lock().get(target).copied()
    }

    /// Make `stat` of `path` fail with `errno` until `path` is unmounted.
    pub fn fail_stat(&self, path: &Path, errno: Errno) {
        self.stat_errors.lock().insert(path.to_path_buf(), errno);
    }

    /// Make `stat` block forever.
    pub fn set_hang_stat(&self, hang: bool) {
        self.hang_stat.store(hang, Ordering::SeqCst);
    }

    /// Every path passed to `unmount`, in order.
    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.unmounted.lock().clone()
    }

    pub fn bind_calls(&self) -> usize {
        self.bind_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    /// Make mount-point checks block forever.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn is_mountpoint(&self, path: &Path) -> Result<bool, CsiError> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.is_mounted(path))
    }

    async fn bind(&self, _source: &Path, target: &Path, read_only: bool) -> Result<(), CsiError> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(CsiError::MountFailed {
                path: target.display().to_string(),
                reason: "injected bind failure".into(),
            });
        }
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        self.binds.lock().insert(target.to_path_buf(), read_only);
        self.mark_mounted(target);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: "injected unmount failure".into(),
            });
        }
        self.unmounted.lock().push(target.to_path_buf());
        self.stat_errors.lock().remove(target);
        self.forget(target);
        Ok(())
    }

    async fn stat_is_dir(&self, path: &Path) -> io::Result<bool> {
        if self.hang_stat.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let injected = self.stat_errors.lock().get(path).copied();
        if let Some(errno) = injected {
            return Err(io::Error::from_raw_os_error(errno as i32));
        }
        tokio::fs::metadata(path).await.map(|m| m.is_dir())
    }
}

/// Mount tool that only flips entries in a [`FakeMounter`].
pub struct FakeBackend {
    mounter: Arc<FakeMounter>,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    quotas: Mutex<Vec<(String, u64)>>,
    fail_mount: AtomicBool,
    fail_quota: AtomicBool,
    mount_delay: Mutex<Duration>,
}

impl FakeBackend {
    pub fn new(mounter: Arc<FakeMounter>) -> Arc<Self> {
        Arc::new(Self {
            mounter,
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            quotas: Mutex::new(Vec::new()),
            fail_mount: AtomicBool::new(false),
            fail_quota: AtomicBool::new(false),
            mount_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Successful mounts so far.
    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    /// Mounts actually stopped so far.
    pub fn unmounts(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    /// `(path, limit_bytes)` of every quota applied.
    pub fn quotas(&self) -> Vec<(String, u64)> {
        self.quotas.lock().clone()
    }

    pub fn set_fail_mount(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_quota(&self, fail: bool) {
        self.fail_quota.store(fail, Ordering::SeqCst);
    }

    pub fn set_mount_delay(&self, delay: Duration) {
        *self.mount_delay.lock() = delay;
    }
}

#[async_trait]
impl MountBackend for FakeBackend {
    async fn mount(
        &self,
        _settings: &MountSettings,
        mount_point: &Path,
    ) -> Result<Option<u32>, CsiError> {
        let delay = *self.mount_delay.lock();
        tokio::time::sleep(delay).await;
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(CsiError::MountFailed {
                path: mount_point.display().to_string(),
                reason: "injected mount failure".into(),
            });
        }
        self.mounter.mark_mounted(mount_point);
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(4242))
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), CsiError> {
        if self.mounter.forget(mount_point) {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn set_quota(
        &self,
        _settings: &MountSettings,
        path: &str,
        limit_bytes: u64,
    ) -> Result<(), CsiError> {
        if self.fail_quota.load(Ordering::SeqCst) {
            return Err(CsiError::BackendError("injected quota failure".into()));
        }
        self.quotas.lock().push((path.to_owned(), limit_bytes));
        Ok(())
    }
}

/// Cluster store held in maps.
#[derive(Default)]
pub struct MemoryCluster {
    volumes: Mutex<BTreeMap<String, PersistentVolume>>,
    malformed: Mutex<HashSet<String>>,
    secrets: Mutex<HashMap<(String, String), HashMap<String, String>>>,
    unavailable: AtomicBool,
    volume_reads: Mutex<HashMap<String, usize>>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_volume(&self, pv: PersistentVolume) {
        self.volumes.lock().insert(pv.name.clone(), pv);
    }

    pub fn remove_volume(&self, name: &str) {
        self.volumes.lock().remove(name);
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.lock().get(name).cloned()
    }

    /// Make `name` listed but undecodable.
    pub fn put_malformed(&self, name: &str) {
        self.malformed.lock().insert(name.to_owned());
    }

    pub fn put_secret(&self, namespace: &str, name: &str, data: HashMap<String, String>) {
        self.secrets
            .lock()
            .insert((namespace.to_owned(), name.to_owned()), data);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many times `name` was fetched.
    pub fn reads_of(&self, name: &str) -> usize {
        self.volume_reads.lock().get(name).copied().unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), ClusterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get_persistent_volume(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolume>, ClusterError> {
        self.check_available()?;
        *self.volume_reads.lock().entry(name.to_owned()).or_default() += 1;
        if self.malformed.lock().contains(name) {
            return Err(ClusterError::Malformed {
                key: name.to_owned(),
                reason: "invalid yaml".into(),
            });
        }
        Ok(self.volume(name))
    }

    async fn list_persistent_volume_names(&self) -> Result<Vec<String>, ClusterError> {
        self.check_available()?;
        let mut names: Vec<String> = self.volumes.lock().keys().cloned().collect();
        names.extend(self.malformed.lock().iter().cloned());
        names.sort();
        Ok(names)
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HashMap<String, String>>, ClusterError> {
        self.check_available()?;
        Ok(self
            .secrets
            .lock()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn patch_volume_annotations(
        &self,
        name: &str,
        patch: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ClusterError> {
        self.check_available()?;
        if let Some(pv) = self.volumes.lock().get_mut(name) {
            pv.apply_annotations(patch);
        }
        Ok(())
    }
}
