//! Background reconciliation of volume objects against local mounts.
//!
//! The reconciler relists persistent volumes on an interval and reconciles
//! each one through a deduplicating work queue:
//!
//! ```text
//! Pending ──▶ Bound ──▶ Released ──▶ Removed
//!                 ▲          │
//!                 └──────────┘ (rebound)
//! ```
//!
//! For every volume it drops binds whose target is no longer mounted,
//! tears down idle sessions whose owners are released or gone, and records
//! the number of local binds in a `<driver>/mounted.<node>` annotation.
//!
//! A failed reconcile is retried with exponential backoff if the failure is
//! transient and dropped if the object is malformed.  The loop itself only
//! stops on cancellation or when relisting keeps failing; either way the
//! outcome is published on a [`watch`] channel so the binary can exit
//! instead of running on without cleanup.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::poll_fn;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{ClusterClient, ClusterError, PersistentVolume, VolumePhase};
use crate::config::ReconcilerConfig;
use crate::error::CsiError;
use crate::mount::{MountProvider, MountSession};
use crate::types::VolumeId;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Mount(#[from] CsiError),

    #[error("cluster store unreachable after {0} consecutive relists")]
    StoreUnreachable(u32),
}

impl ReconcileError {
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Cluster(e) => e.is_transient(),
            ReconcileError::Mount(_) => true,
            ReconcileError::StoreUnreachable(_) => false,
        }
    }
}

/// Lifecycle state of a tracked volume as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedState {
    Pending,
    Bound,
    Released,
    Removed,
}

impl TrackedState {
    pub fn of(pv: Option<&PersistentVolume>) -> Self {
        match pv.map(|pv| pv.phase) {
            None => TrackedState::Removed,
            Some(VolumePhase::Pending | VolumePhase::Available) => TrackedState::Pending,
            Some(VolumePhase::Bound) => TrackedState::Bound,
            Some(VolumePhase::Released | VolumePhase::Failed) => TrackedState::Released,
        }
    }

    fn needs_cleanup(self) -> bool {
        matches!(self, TrackedState::Released | TrackedState::Removed)
    }
}

/// What one reconcile changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub state: TrackedState,
    pub pruned_binds: usize,
    pub torn_down: usize,
    pub patched: bool,
}

impl ReconcileReport {
    fn new(state: TrackedState) -> Self {
        Self {
            state,
            pruned_binds: 0,
            torn_down: 0,
            patched: false,
        }
    }

    pub fn changed(&self) -> bool {
        self.pruned_binds > 0 || self.torn_down > 0 || self.patched
    }
}

/// Retry delay after `failures` previous failures.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(failures)).min(max)
}

/// Deduplicating queue of volume names with per-item backoff.
struct WorkQueue {
    ready: VecDeque<String>,
    /// Names in `ready` or waiting in `delayed`.
    queued: HashSet<String>,
    delayed: DelayQueue<String>,
    delayed_keys: HashMap<String, delay_queue::Key>,
    failures: HashMap<String, u32>,
    base: Duration,
    max: Duration,
}

impl WorkQueue {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            delayed: DelayQueue::new(),
            delayed_keys: HashMap::new(),
            failures: HashMap::new(),
            base,
            max,
        }
    }

    /// Queue `name` unless it is already queued or backing off.
    fn add(&mut self, name: String) {
        if self.queued.insert(name.clone()) {
            self.ready.push_back(name);
        }
    }

    fn pop(&mut self) -> Option<String> {
        let name = self.ready.pop_front()?;
        self.queued.remove(&name);
        Some(name)
    }

    /// Retry `name` after its backoff delay.
    fn requeue(&mut self, name: String) -> Duration {
        let failures = self.failures.entry(name.clone()).or_insert(0);
        let delay = backoff_delay(self.base, self.max, *failures);
        *failures = failures.saturating_add(1);
        if self.queued.insert(name.clone()) {
            let key = self.delayed.insert(name.clone(), delay);
            self.delayed_keys.insert(name, key);
        }
        delay
    }

    /// Move an expired retry to the ready list.
    fn promote(&mut self, name: String) {
        self.delayed_keys.remove(&name);
        self.ready.push_back(name);
    }

    fn forget(&mut self, name: &str) {
        self.failures.remove(name);
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }
}

/// Health of a supervised loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopHealth {
    Running,
    /// Stopped after cancellation.
    Stopped,
    Failed(String),
}

/// A reconciler running on its own task.
pub struct ReconcilerHandle {
    pub task: JoinHandle<()>,
    pub health: watch::Receiver<LoopHealth>,
}

pub struct VolumeReconciler {
    node_id: String,
    config: ReconcilerConfig,
    cluster: Arc<dyn ClusterClient>,
    provider: Arc<MountProvider>,
}

impl VolumeReconciler {
    pub fn new(
        node_id: impl Into<String>,
        config: ReconcilerConfig,
        cluster: Arc<dyn ClusterClient>,
        provider: Arc<MountProvider>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            cluster,
            provider,
        }
    }

    /// Annotation carrying this node's bind count.
    pub fn annotation_key(&self) -> String {
        format!("{}/mounted.{}", self.config.driver_name, self.node_id)
    }

    fn serves(&self, pv: &PersistentVolume) -> bool {
        pv.driver
            .as_deref()
            .is_none_or(|d| d == self.config.driver_name)
    }

    /// Whether every owner of `session` is released or gone.
    async fn owners_gone(&self, session: &MountSession) -> Result<bool, ReconcileError> {
        for owner in session.owners() {
            let pv = self.cluster.get_persistent_volume(owner.as_str()).await?;
            if !TrackedState::of(pv.as_ref()).needs_cleanup() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Bring local state for the volume object `name` in line with the
    /// cluster.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileReport, ReconcileError> {
        let pv = self.cluster.get_persistent_volume(name).await?;
        if let Some(pv) = &pv
            && !self.serves(pv)
        {
            return Ok(ReconcileReport::new(TrackedState::of(Some(pv))));
        }

        let state = TrackedState::of(pv.as_ref());
        let volume_id = pv
            .as_ref()
            .map_or_else(|| VolumeId::from(name), PersistentVolume::volume_id);
        let mut report = ReconcileReport::new(state);

        for released in self.provider.prune_stale_binds(&volume_id).await? {
            report.pruned_binds += 1;
            debug!(session = %released.key, remaining = released.remaining, "stale bind dropped");
        }

        if state.needs_cleanup() {
            for session in self.provider.sessions() {
                if session.ref_count() > 0 || !session.owners().contains(&volume_id) {
                    continue;
                }
                if self.owners_gone(&session).await?
                    && self.provider.teardown_if_idle(session.key()).await?
                {
                    report.torn_down += 1;
                }
            }
        }

        if let Some(pv) = &pv {
            let key = self.annotation_key();
            let bound = self.provider.targets_for_volume(&volume_id).len();
            let desired = (bound > 0).then(|| bound.to_string());
            if pv.annotations.get(&key) != desired.as_ref() {
                let patch = BTreeMap::from([(key, desired)]);
                self.cluster
                    .patch_volume_annotations(&pv.name, &patch)
                    .await?;
                report.patched = true;
            }
        }

        Ok(report)
    }

    /// Queue every known volume and sweep sessions past their grace period.
    async fn resync(&self, queue: &mut WorkQueue) -> Result<usize, ReconcileError> {
        let names = self.cluster.list_persistent_volume_names().await?;
        let listed = names.len();
        for name in names {
            queue.add(name);
        }
        // Locally owned volumes are visited too, so removed objects get
        // cleaned up.
        for session in self.provider.sessions() {
            for owner in session.owners() {
                queue.add(owner.0);
            }
        }
        for key in self.provider.sweep_idle().await {
            info!(session = %key, "idle mount session swept");
        }
        Ok(listed)
    }

    async fn drain(&self, queue: &mut WorkQueue, cancel: &CancellationToken) {
        while let Some(name) = queue.pop() {
            if cancel.is_cancelled() {
                return;
            }
            match self.reconcile(&name).await {
                Ok(report) => {
                    queue.forget(&name);
                    if report.changed() {
                        info!(volume = %name, ?report, "volume reconciled");
                    }
                }
                Err(e) if e.is_transient() => {
                    let delay = queue.requeue(name.clone());
                    warn!(volume = %name, error = %e, ?delay, "reconcile failed, retrying");
                }
                Err(e) => {
                    queue.forget(&name);
                    error!(volume = %name, error = %e, "dropping volume that cannot be reconciled");
                }
            }
        }
    }

    /// Run until `cancel` fires or relisting fails
    /// `max_list_failures` times in a row.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ReconcileError> {
        let mut queue = WorkQueue::new(self.config.backoff_base, self.config.backoff_max);
        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut list_failures = 0u32;
        info!(node = %self.node_id, "volume reconciler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("volume reconciler stopped");
                    return Ok(());
                }
                _ = resync.tick() => {
                    match self.resync(&mut queue).await {
                        Ok(listed) => {
                            list_failures = 0;
                            debug!(listed, "resync");
                        }
                        Err(e) => {
                            list_failures += 1;
                            warn!(error = %e, attempt = list_failures, "relist failed");
                            if list_failures >= self.config.max_list_failures {
                                return Err(ReconcileError::StoreUnreachable(list_failures));
                            }
                        }
                    }
                }
                Some(expired) = poll_fn(|cx| queue.delayed.poll_expired(cx)), if !queue.delayed.is_empty() => {
                    queue.promote(expired.into_inner());
                }
            }
            self.drain(&mut queue, &cancel).await;
        }
    }

    /// Run on a new task, reporting how the loop ended.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> ReconcilerHandle {
        let (tx, rx) = watch::channel(LoopHealth::Running);
        let task = tokio::spawn(async move {
            let health = match AssertUnwindSafe(self.run(cancel)).catch_unwind().await {
                Ok(Ok(())) => LoopHealth::Stopped,
                Ok(Err(e)) => {
                    error!(error = %e, "volume reconciler failed");
                    LoopHealth::Failed(e.to_string())
                }
                Err(_) => {
                    error!("volume reconciler panicked");
                    LoopHealth::Failed("reconciler panicked".into())
                }
            };
            let _ = tx.send(health);
        });
        ReconcilerHandle { task, health: rx }
    }
}
