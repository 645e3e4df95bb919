//! Mount sessions shared between volumes.
//!
//! The [`MountProvider`] keeps at most one live [`MountSession`] per
//! [`SessionKey`].  Volumes whose settings differ only in their sub-path
//! bind different directories of the same session.  A session's refcount is
//! the number of distinct target paths that consume it; it is updated under a
//! lock scoped to that session, so unrelated volumes never contend.
//!
//! # Layout
//!
//! ```text
//! <mount_root>/
//!   <session-key>/            # live mount of the distributed filesystem
//!     <sub-path>/             # bind source for one volume
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::NodeConfig;
use crate::error::CsiError;
use crate::mount::process::MountBackend;
use crate::mount::{Mounter, is_corrupted_mount};
use crate::settings::{MountSettings, SessionKey};
use crate::types::VolumeId;

type SessionSlot = Arc<tokio::sync::Mutex<Option<Arc<MountSession>>>>;

#[derive(Debug)]
struct SessionState {
    pid: Option<u32>,
    /// Consuming target paths and the volume each one publishes.
    consumers: HashMap<PathBuf, VolumeId>,
    /// Every volume that has ever consumed this session.
    owners: HashSet<VolumeId>,
    idle_since: Option<Instant>,
}

/// One running instance of the external mount process.
#[derive(Debug)]
pub struct MountSession {
    key: SessionKey,
    settings: MountSettings,
    mount_point: PathBuf,
    created_at: Instant,
    state: Mutex<SessionState>,
}

impl MountSession {
    fn new(key: SessionKey, settings: MountSettings, mount_point: PathBuf, pid: Option<u32>) -> Self {
        let now = Instant::now();
        Self {
            key,
            settings,
            mount_point,
            created_at: now,
            state: Mutex::new(SessionState {
                pid,
                consumers: HashMap::new(),
                owners: HashSet::new(),
                idle_since: Some(now),
            }),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Settings the session was launched with.
    pub fn settings(&self) -> &MountSettings {
        &self.settings
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    /// Number of target paths bound into this session.
    pub fn ref_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Volumes that have consumed this session, sorted.
    pub fn owners(&self) -> Vec<VolumeId> {
        let mut owners: Vec<VolumeId> = self.state.lock().owners.iter().cloned().collect();
        owners.sort();
        owners
    }

    /// Target paths currently publishing `volume_id`.
    pub fn targets_of(&self, volume_id: &VolumeId) -> Vec<PathBuf> {
        self.state
            .lock()
            .consumers
            .iter()
            .filter(|(_, v)| *v == volume_id)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Whether nothing has consumed the session for at least `grace`.
    pub fn is_idle_for(&self, grace: Duration) -> bool {
        let state = self.state.lock();
        state.consumers.is_empty() && state.idle_since.is_some_and(|t| t.elapsed() >= grace)
    }

    fn set_pid(&self, pid: Option<u32>) {
        self.state.lock().pid = pid;
    }

    /// Add a consumer. Returns `false` if `target` was already counted.
    fn acquire(&self, volume_id: &VolumeId, target: &Path) -> bool {
        let mut state = self.state.lock();
        state.owners.insert(volume_id.clone());
        state.idle_since = None;
        state
            .consumers
            .insert(target.to_path_buf(), volume_id.clone())
            .is_none()
    }

    /// Drop a consumer, returning what it published and the remaining count.
    fn release(&self, target: &Path) -> Option<(VolumeId, usize)> {
        let mut state = self.state.lock();
        let volume_id = state.consumers.remove(target)?;
        let remaining = state.consumers.len();
        if remaining == 0 {
            state.idle_since = Some(Instant::now());
        }
        Some((volume_id, remaining))
    }
}

/// A consumer removed from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub key: SessionKey,
    pub volume_id: VolumeId,
    /// Consumers left; `0` makes the session eligible for teardown.
    pub remaining: usize,
}

/// Count `target` as a consumer of `session` and index it.
fn claim(
    live: &DashMap<SessionKey, Arc<MountSession>>,
    targets: &DashMap<PathBuf, SessionKey>,
    session: &MountSession,
    volume_id: &VolumeId,
    target: &Path,
) {
    if let Some(prev) = targets.insert(target.to_path_buf(), session.key.clone())
        && prev != session.key
        && let Some(old) = live.get(&prev).map(|s| Arc::clone(&s))
    {
        // The target moved to another session: settings changed between
        // two publishes of the same path.
        old.release(target);
    }
    if session.acquire(volume_id, target) {
        debug!(target = %target.display(), refs = session.ref_count(), "consumer added");
    }
}

/// Owner of all mount sessions on this node.
pub struct MountProvider {
    mount_root: PathBuf,
    backend: Arc<dyn MountBackend>,
    mounter: Arc<dyn Mounter>,
    startup_timeout: Duration,
    teardown_grace: Duration,
    /// Creation slots; the slot mutex serializes launch and teardown per key.
    slots: DashMap<SessionKey, SessionSlot>,
    /// Sessions that are up, for lock-free lookup.
    live: Arc<DashMap<SessionKey, Arc<MountSession>>>,
    /// Which session each bound target belongs to.
    targets: Arc<DashMap<PathBuf, SessionKey>>,
}

impl MountProvider {
    pub fn new(
        config: &NodeConfig,
        backend: Arc<dyn MountBackend>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            mount_root: config.mount_root.clone(),
            backend,
            mounter,
            startup_timeout: config.startup_timeout,
            teardown_grace: config.teardown_grace,
            slots: DashMap::new(),
            live: Arc::new(DashMap::new()),
            targets: Arc::new(DashMap::new()),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn session(&self, key: &SessionKey) -> Option<Arc<MountSession>> {
        self.live.get(key).map(|s| Arc::clone(&s))
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<Arc<MountSession>> {
        self.live.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Session a target path is bound into, if any.
    pub fn session_for_target(&self, target: &Path) -> Option<Arc<MountSession>> {
        let key = self.targets.get(target).map(|k| k.clone())?;
        self.session(&key)
    }

    /// Target paths publishing `volume_id` across all sessions.
    pub fn targets_for_volume(&self, volume_id: &VolumeId) -> Vec<PathBuf> {
        self.sessions()
            .iter()
            .flat_map(|s| s.targets_of(volume_id))
            .collect()
    }

    /// Create `path` as a directory if needed. A dead FUSE mount left at
    /// `path` is lazily unmounted and reused.
    pub async fn create_target(&self, path: &Path) -> Result<(), CsiError> {
        match self.mounter.stat_is_dir(path).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(CsiError::Internal(format!(
                "{} exists and is not a directory",
                path.display()
            ))),
            Err(e) if is_corrupted_mount(&e) => {
                warn!(path = %path.display(), error = %e, "corrupted mount point, unmounting");
                self.mounter.unmount(path).await
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(path).await.map_err(|e| {
                    CsiError::Internal(format!("create dir {}: {e}", path.display()))
                })
            }
            Err(e) => Err(CsiError::Internal(format!("stat {}: {e}", path.display()))),
        }
    }

    /// Return the session for `settings`, launching it if needed, and count
    /// `target` as one of its consumers.
    ///
    /// Concurrent calls with equivalent settings launch at most one process.
    /// The launch runs on its own task while holding the slot, so a caller
    /// that gives up never leaves a half-created session behind.
    #[instrument(skip_all, fields(session = tracing::field::Empty, volume_id = %volume_id))]
    pub async fn ensure_session(
        &self,
        settings: &MountSettings,
        volume_id: &VolumeId,
        target: &Path,
    ) -> Result<Arc<MountSession>, CsiError> {
        let key = settings.session_key();
        tracing::Span::current().record("session", tracing::field::display(&key));

        let slot = Arc::clone(&self.slots.entry(key.clone()).or_default());
        let mut guard = slot.lock_owned().await;

        let existing = guard.clone();
        if let Some(session) = &existing {
            if self.mounter.is_mountpoint(&session.mount_point).await? {
                self.live.insert(key.clone(), Arc::clone(session));
                claim(&self.live, &self.targets, session, volume_id, target);
                debug!(refs = session.ref_count(), "reusing mount session");
                return Ok(Arc::clone(session));
            }
            warn!("mount session is no longer mounted, relaunching");
            if let Err(e) = self.backend.unmount(&session.mount_point).await {
                warn!(error = %e, "cleanup of dead mount session failed");
            }
        }

        let mount_point = self.mount_root.join(key.as_str());
        self.create_target(&mount_point).await?;

        let backend = Arc::clone(&self.backend);
        let live = Arc::clone(&self.live);
        let targets = Arc::clone(&self.targets);
        let startup_timeout = self.startup_timeout;
        let settings = settings.clone();
        let (consumer, consumer_target) = (volume_id.clone(), target.to_path_buf());
        let launch = tokio::spawn(async move {
            let pid = match tokio::time::timeout(
                startup_timeout,
                backend.mount(&settings, &mount_point),
            )
            .await
            {
                Ok(res) => res?,
                Err(_) => {
                    if let Err(e) = backend.unmount(&mount_point).await {
                        warn!(error = %e, "cleanup after startup timeout failed");
                    }
                    return Err(CsiError::Timeout {
                        what: format!("mount session {key} to become ready"),
                        millis: u64::try_from(startup_timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            };
            let session = match existing {
                Some(session) => {
                    session.set_pid(pid);
                    session
                }
                None => Arc::new(MountSession::new(key.clone(), settings, mount_point, pid)),
            };
            *guard = Some(Arc::clone(&session));
            live.insert(key, Arc::clone(&session));
            // Claimed before the slot is released: an idle sweep cannot take
            // the session down first, and a cancelled caller's target stays
            // reachable by unbind.
            claim(&live, &targets, &session, &consumer, &consumer_target);
            Ok(session)
        });

        let session = launch.await.map_err(CsiError::internal)??;
        info!(
            mount_point = %session.mount_point.display(),
            pid = ?session.pid(),
            "mount session ready"
        );
        Ok(session)
    }

    /// Create the bind source for `sub_path` inside the session.
    pub async fn create_volume_dir(
        &self,
        session: &MountSession,
        sub_path: &str,
    ) -> Result<PathBuf, CsiError> {
        let source = if sub_path.is_empty() {
            session.mount_point.clone()
        } else {
            session.mount_point.join(sub_path)
        };
        tokio::fs::create_dir_all(&source)
            .await
            .map_err(|e| CsiError::Internal(format!("create dir {}: {e}", source.display())))?;
        Ok(source)
    }

    /// Bind `source` at `target`. Binding an already-bound target succeeds.
    pub async fn bind(
        &self,
        session: &MountSession,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        if self.mounter.is_mountpoint(target).await? {
            debug!(session = %session.key, target = %target.display(), "target already bound");
            return Ok(());
        }
        self.mounter.bind(source, target, read_only).await
    }

    /// Undo the consumer count of a publish that failed before `target` was
    /// bound. Bound targets keep their reference.
    pub async fn abandon(
        &self,
        session: &MountSession,
        target: &Path,
    ) -> Result<Option<Released>, CsiError> {
        if self.mounter.is_mountpoint(target).await? {
            return Ok(None);
        }
        self.targets.remove_if(target, |_, k| *k == session.key);
        Ok(session
            .release(target)
            .map(|(volume_id, remaining)| Released {
                key: session.key.clone(),
                volume_id,
                remaining,
            }))
    }

    /// Unmount `target` and drop its consumer reference. An absent bind
    /// succeeds with `None`.
    #[instrument(skip_all, fields(target = %target.display()))]
    pub async fn unbind(&self, target: &Path) -> Result<Option<Released>, CsiError> {
        if self.mounter.is_mountpoint(target).await? {
            self.mounter.unmount(target).await?;
        } else {
            debug!("target not mounted");
        }

        match tokio::fs::remove_dir(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(error = %e, "target directory left in place"),
        }

        let Some((_, key)) = self.targets.remove(target) else {
            return Ok(None);
        };
        let Some(session) = self.session(&key) else {
            return Ok(None);
        };
        Ok(session
            .release(target)
            .map(|(volume_id, remaining)| Released {
                key,
                volume_id,
                remaining,
            }))
    }

    /// Forward a quota request to the session's filesystem.
    pub async fn apply_quota(
        &self,
        session: &MountSession,
        path: &str,
        limit_bytes: u64,
    ) -> Result<(), CsiError> {
        self.backend
            .set_quota(&session.settings, path, limit_bytes)
            .await
    }

    /// Drop consumers of `volume_id` whose target is no longer mounted.
    pub async fn prune_stale_binds(
        &self,
        volume_id: &VolumeId,
    ) -> Result<Vec<Released>, CsiError> {
        let mut released = Vec::new();
        for session in self.sessions() {
            for target in session.targets_of(volume_id) {
                if self.mounter.is_mountpoint(&target).await? {
                    continue;
                }
                warn!(session = %session.key, target = %target.display(), "dropping stale bind");
                self.targets.remove_if(&target, |_, k| *k == session.key);
                if let Some((volume_id, remaining)) = session.release(&target) {
                    released.push(Released {
                        key: session.key.clone(),
                        volume_id,
                        remaining,
                    });
                }
            }
        }
        Ok(released)
    }

    /// Stop the session if it has had no consumers for the grace period.
    /// Returns whether it was torn down.
    #[instrument(skip_all, fields(session = %key))]
    pub async fn teardown_if_idle(&self, key: &SessionKey) -> Result<bool, CsiError> {
        let Some(slot) = self.slots.get(key).map(|s| Arc::clone(&s)) else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        let Some(session) = guard.clone() else {
            return Ok(false);
        };
        if !session.is_idle_for(self.teardown_grace) {
            return Ok(false);
        }

        self.backend.unmount(&session.mount_point).await?;
        *guard = None;
        self.live.remove(key);
        drop(guard);
        drop(slot);
        self.slots.remove_if(key, |_, s| Arc::strong_count(s) == 1);

        if let Err(e) = tokio::fs::remove_dir(&session.mount_point).await {
            debug!(error = %e, "mount point directory left in place");
        }
        info!(
            lifetime = ?session.created_at.elapsed(),
            "mount session torn down"
        );
        Ok(true)
    }

    /// Tear the session down after the grace period unless it is reused.
    pub fn schedule_teardown(self: &Arc<Self>, key: SessionKey) {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(provider.teardown_grace).await;
            match provider.teardown_if_idle(&key).await {
                Ok(true) => {}
                Ok(false) => debug!(session = %key, "session in use again, kept"),
                Err(e) => warn!(session = %key, error = %e, "scheduled teardown failed"),
            }
        });
    }

    /// Tear down every session that is past its grace period.
    pub async fn sweep_idle(&self) -> Vec<SessionKey> {
        let mut swept = Vec::new();
        let keys: Vec<SessionKey> = self.live.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            match self.teardown_if_idle(&key).await {
                Ok(true) => swept.push(key),
                Ok(false) => {}
                Err(e) => warn!(session = %key, error = %e, "idle session teardown failed"),
            }
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::*;
    use crate::settings;
    use crate::testing::{FakeBackend, FakeMounter, test_config};

    fn settings_for(volume: &str, sub_path: &str) -> MountSettings {
        let secrets = HashMap::from([
            ("name".to_owned(), "shared".to_owned()),
            ("metaurl".to_owned(), "redis://meta/1".to_owned()),
        ]);
        let ctx = HashMap::from([("subPath".to_owned(), sub_path.to_owned())]);
        settings::resolve(&volume.into(), &secrets, &ctx, &[]).unwrap()
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        mounter: Arc<FakeMounter>,
        backend: Arc<FakeBackend>,
        provider: Arc<MountProvider>,
    }

    fn fixture(grace: Duration) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let mut config = test_config(&root);
        config.teardown_grace = grace;
        let mounter = FakeMounter::new();
        let backend = FakeBackend::new(Arc::clone(&mounter));
        let provider = Arc::new(MountProvider::new(
            &config,
            backend.clone(),
            mounter.clone(),
        ));
        Fixture {
            _tmp: tmp,
            root,
            mounter,
            backend,
            provider,
        }
    }

    async fn publish(f: &Fixture, volume: &str, sub_path: &str) -> Arc<MountSession> {
        let settings = settings_for(volume, sub_path);
        let target = f.root.join("pods").join(volume);
        f.provider.create_target(&target).await.unwrap();
        let session = f
            .provider
            .ensure_session(&settings, &volume.into(), &target)
            .await
            .unwrap();
        let source = f
            .provider
            .create_volume_dir(&session, &settings.sub_path)
            .await
            .unwrap();
        f.provider
            .bind(&session, &source, &target, false)
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn equal_settings_share_one_session() {
        let f = fixture(Duration::ZERO);
        let a = publish(&f, "pv-a", "a").await;
        let b = publish(&f, "pv-b", "b").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(f.backend.mounts(), 1);
        assert!(a.mount_point().join("a").is_dir());
        assert!(a.mount_point().join("b").is_dir());
        assert_eq!(a.owners(), vec![VolumeId::from("pv-a"), VolumeId::from("pv-b")]);
    }

    #[tokio::test]
    async fn repeated_claims_do_not_inflate_refcount() {
        let f = fixture(Duration::ZERO);
        let first = publish(&f, "pv-a", "a").await;
        let second = publish(&f, "pv-a", "a").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 1);
        assert_eq!(f.mounter.bind_calls(), 1);
    }

    #[tokio::test]
    async fn unbind_of_absent_target_is_noop() {
        let f = fixture(Duration::ZERO);
        let released = f
            .provider
            .unbind(&f.root.join("never-bound"))
            .await
            .unwrap();
        assert!(released.is_none());
    }

    #[tokio::test]
    async fn last_unbind_makes_session_idle_once() {
        let f = fixture(Duration::ZERO);
        let session = publish(&f, "pv-a", "a").await;
        publish(&f, "pv-b", "b").await;

        let r1 = f
            .provider
            .unbind(&f.root.join("pods/pv-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r1.remaining, 1);
        assert!(!f.provider.teardown_if_idle(session.key()).await.unwrap());

        let r2 = f
            .provider
            .unbind(&f.root.join("pods/pv-b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r2.remaining, 0);
        assert_eq!(r2.volume_id, VolumeId::from("pv-b"));

        assert!(f.provider.teardown_if_idle(session.key()).await.unwrap());
        assert!(!f.provider.teardown_if_idle(session.key()).await.unwrap());
        assert_eq!(f.backend.unmounts(), 1);
        assert!(f.provider.sessions().is_empty());
    }

    #[tokio::test]
    async fn grace_period_delays_teardown() {
        let f = fixture(Duration::from_secs(3600));
        let session = publish(&f, "pv-a", "a").await;
        f.provider
            .unbind(&f.root.join("pods/pv-a"))
            .await
            .unwrap();
        assert!(!f.provider.teardown_if_idle(session.key()).await.unwrap());
        assert!(f.provider.sweep_idle().await.is_empty());
        assert_eq!(f.backend.unmounts(), 0);
    }

    #[tokio::test]
    async fn concurrent_publish_and_unpublish_balance_refcount() {
        let f = fixture(Duration::ZERO);
        let n = 16;
        let mut tasks = Vec::new();
        for i in 0..n {
            let provider = Arc::clone(&f.provider);
            let root = f.root.clone();
            tasks.push(tokio::spawn(async move {
                let volume = format!("pv-{i}");
                let settings = settings_for(&volume, &volume);
                let target = root.join("pods").join(&volume);
                provider.create_target(&target).await.unwrap();
                let session = provider
                    .ensure_session(&settings, &volume.as_str().into(), &target)
                    .await
                    .unwrap();
                let source = provider
                    .create_volume_dir(&session, &settings.sub_path)
                    .await
                    .unwrap();
                provider.bind(&session, &source, &target, false).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(f.backend.mounts(), 1);
        let session = f.provider.sessions().pop().unwrap();
        assert_eq!(session.ref_count(), n);

        let mut tasks = Vec::new();
        for i in 0..n {
            let provider = Arc::clone(&f.provider);
            let target = f.root.join("pods").join(format!("pv-{i}"));
            tasks.push(tokio::spawn(async move {
                provider.unbind(&target).await.unwrap().unwrap()
            }));
        }
        let mut idle_transitions = 0;
        for t in tasks {
            if t.await.unwrap().remaining == 0 {
                idle_transitions += 1;
            }
        }
        assert_eq!(session.ref_count(), 0);
        assert_eq!(idle_transitions, 1);
    }

    #[tokio::test]
    async fn startup_timeout_fails_session_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.startup_timeout = Duration::from_millis(50);
        let mounter = FakeMounter::new();
        let backend = FakeBackend::new(Arc::clone(&mounter));
        backend.set_mount_delay(Duration::from_secs(10));
        let provider = MountProvider::new(&config, backend.clone(), mounter);

        let err = provider
            .ensure_session(&settings_for("pv-a", "a"), &"pv-a".into(), &tmp.path().join("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Timeout { .. }), "{err}");
        assert!(provider.sessions().is_empty());
    }

    #[tokio::test]
    async fn cancelled_publish_leaves_a_reclaimable_session() {
        let f = fixture(Duration::ZERO);
        f.backend.set_mount_delay(Duration::from_millis(200));
        let target = f.root.join("pods/pv-a");

        let provider = Arc::clone(&f.provider);
        let caller_target = target.clone();
        let caller = tokio::spawn(async move {
            provider
                .ensure_session(&settings_for("pv-a", "a"), &"pv-a".into(), &caller_target)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        // The launch finishes on its own task.
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.provider.sessions().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let session = f.provider.sessions().pop().unwrap();
        assert_eq!(session.ref_count(), 1);

        let released = f.provider.unbind(&target).await.unwrap().unwrap();
        assert_eq!(released.remaining, 0);
        assert!(f.provider.teardown_if_idle(session.key()).await.unwrap());
        assert!(f.provider.sessions().is_empty());
    }

    #[tokio::test]
    async fn corrupted_target_is_unmounted_and_reused() {
        let f = fixture(Duration::ZERO);
        let target = f.root.join("pods/pv-a");
        std::fs::create_dir_all(&target).unwrap();
        f.mounter.fail_stat(&target, Errno::ENOTCONN);

        f.provider.create_target(&target).await.unwrap();
        assert_eq!(f.mounter.unmounted(), vec![target.clone()]);
        f.provider.create_target(&target).await.unwrap();
        assert_eq!(f.mounter.unmounted().len(), 1);
    }

    #[tokio::test]
    async fn target_that_is_a_file_is_rejected() {
        let f = fixture(Duration::ZERO);
        let target = f.root.join("file");
        std::fs::write(&target, b"x").unwrap();
        let err = f.provider.create_target(&target).await.unwrap_err();
        assert!(err.to_string().contains("not a directory"), "{err}");
    }

    #[tokio::test]
    async fn dead_session_is_relaunched_in_place() {
        let f = fixture(Duration::ZERO);
        let session = publish(&f, "pv-a", "a").await;
        f.mounter.forget(session.mount_point());

        let again = publish(&f, "pv-a", "a").await;
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(f.backend.mounts(), 2);
        assert_eq!(again.ref_count(), 1);
    }

    #[tokio::test]
    async fn failed_bind_is_abandoned() {
        let f = fixture(Duration::ZERO);
        let settings = settings_for("pv-a", "a");
        let target = f.root.join("pods/pv-a");
        let session = f
            .provider
            .ensure_session(&settings, &"pv-a".into(), &target)
            .await
            .unwrap();
        assert_eq!(session.ref_count(), 1);

        let released = f.provider.abandon(&session, &target).await.unwrap().unwrap();
        assert_eq!(released.remaining, 0);
        assert!(f.provider.session_for_target(&target).is_none());
    }

    #[tokio::test]
    async fn stale_binds_are_pruned() {
        let f = fixture(Duration::ZERO);
        let session = publish(&f, "pv-a", "a").await;
        let target = f.root.join("pods/pv-a");
        f.mounter.forget(&target);

        let pruned = f.provider.prune_stale_binds(&"pv-a".into()).await.unwrap();
        assert_eq!(pruned.len(), 1);
        assert_eq!(session.ref_count(), 0);
        assert!(f.provider.targets_for_volume(&"pv-a".into()).is_empty());
    }
}
