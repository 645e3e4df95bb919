//! The node service: publish, unpublish and usage reporting.
//!
//! [`NodeService`] validates requests, resolves mount settings and drives the
//! [`MountProvider`].  Calls for the same volume are serialized by a
//! per-volume lock; calls for different volumes run in parallel and only
//! meet inside the provider's per-session locks.
//!
//! A publish proceeds as
//!
//! ```text
//! validate → target dir → secrets → settings → session → volume dir → bind → quota
//! ```
//!
//! Only the quota step is best-effort: its failure is logged and recorded,
//! never returned.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{ClusterClient, PersistentVolume};
use crate::config::NodeConfig;
use crate::error::{Code, CsiError};
use crate::identity::CsiIdentity;
use crate::metrics::NodeMetrics;
use crate::mount::{MountProvider, MountSession, Mounter};
use crate::node::CsiNode;
use crate::settings::{self, CTX_SECRET_NAME, CTX_SECRET_NAMESPACE, MountSettings};
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, PluginInfo, UsageUnit, VolumeCapability, VolumeId,
    VolumeStats, VolumeUsage,
};
use crate::util::{self, do_with_timeout};

const DEFAULT_SECRET_NAMESPACE: &str = "default";

/// Last quota failure of a volume, kept until a later publish succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaFailure {
    /// Filesystem path the quota was meant for, if it could be resolved.
    pub path: Option<String>,
    pub limit_bytes: u64,
    pub reason: String,
    pub at: SystemTime,
}

/// Validated parts of a publish request.
struct PublishPlan {
    capability: VolumeCapability,
    requested_capacity: Option<u64>,
}

fn validate_publish(req: &NodePublishVolumeRequest) -> Result<PublishPlan, CsiError> {
    if req.volume_id.is_empty() {
        return Err(CsiError::InvalidArgument("Volume ID not provided".into()));
    }
    if req.target_path.is_empty() {
        return Err(CsiError::InvalidArgument("Target path not provided".into()));
    }
    let Some(capability) = req.volume_capability.clone() else {
        return Err(CsiError::InvalidArgument(
            "Volume capability not provided".into(),
        ));
    };
    if !capability.is_supported() {
        return Err(CsiError::InvalidArgument(format!(
            "Volume capability not supported: {capability:?}"
        )));
    }
    let requested_capacity =
        settings::requested_capacity(&req.volume_context, req.capacity_bytes)?;
    Ok(PublishPlan {
        capability,
        requested_capacity,
    })
}

/// Holds a per-volume lock entry and prunes it from the table on drop, also
/// when the call holding it is cancelled.
struct VolumeLockEntry<'a> {
    locks: &'a DashMap<VolumeId, Arc<Mutex<()>>>,
    volume_id: &'a VolumeId,
    lock: Arc<Mutex<()>>,
}

impl Drop for VolumeLockEntry<'_> {
    fn drop(&mut self) {
        // Only the table and this entry still reference the lock.
        self.locks.remove_if(self.volume_id, |_, l| {
            Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2
        });
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub struct NodeService {
    node_id: String,
    config: NodeConfig,
    provider: Arc<MountProvider>,
    mounter: Arc<dyn Mounter>,
    cluster: Option<Arc<dyn ClusterClient>>,
    metrics: NodeMetrics,
    volume_locks: DashMap<VolumeId, Arc<Mutex<()>>>,
    quota_failures: DashMap<VolumeId, QuotaFailure>,
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        config: NodeConfig,
        provider: Arc<MountProvider>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            provider,
            mounter,
            cluster: None,
            metrics: NodeMetrics::new(),
            volume_locks: DashMap::new(),
            quota_failures: DashMap::new(),
        }
    }

    /// Read volume objects and secrets from `cluster`.
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_metrics(mut self, metrics: NodeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn provider(&self) -> &Arc<MountProvider> {
        &self.provider
    }

    /// The most recent unresolved quota failure of `volume_id`.
    pub fn last_quota_failure(&self, volume_id: &VolumeId) -> Option<QuotaFailure> {
        self.quota_failures.get(volume_id).map(|f| f.clone())
    }

    async fn with_volume_lock<T>(&self, volume_id: &VolumeId, op: impl Future<Output = T>) -> T {
        let entry = VolumeLockEntry {
            locks: &self.volume_locks,
            volume_id,
            lock: Arc::clone(&self.volume_locks.entry(volume_id.clone()).or_default()),
        };
        let _guard = entry.lock.lock().await;
        op.await
    }

    /// Number of volumes with a lock entry.
    pub fn locked_volumes(&self) -> usize {
        self.volume_locks.len()
    }

    /// The volume object behind `volume_id`, if the cluster has one.
    /// Lookup failures only cost the declared capacity.
    async fn fetch_persistent_volume(&self, volume_id: &VolumeId) -> Option<PersistentVolume> {
        let cluster = self.cluster.as_ref()?;
        match cluster.get_persistent_volume(volume_id.as_str()).await {
            Ok(Some(pv)) => Some(pv),
            Ok(None) => {
                warn!(%volume_id, "volume object not found, using request values");
                None
            }
            Err(e) => {
                warn!(%volume_id, error = %e, "volume object lookup failed, using request values");
                None
            }
        }
    }

    /// Request secrets merged over the secret named in the volume context.
    async fn publish_secrets(
        &self,
        req: &NodePublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        let Some(name) = req.volume_context.get(CTX_SECRET_NAME) else {
            return Ok(req.secrets.clone());
        };
        let namespace = req
            .volume_context
            .get(CTX_SECRET_NAMESPACE)
            .map_or(DEFAULT_SECRET_NAMESPACE, String::as_str);
        let Some(cluster) = &self.cluster else {
            return Err(CsiError::InvalidArgument(format!(
                "secret {namespace}/{name} referenced but no cluster store is configured"
            )));
        };
        let mut merged = cluster
            .get_secret(namespace, name)
            .await
            .map_err(|e| CsiError::Internal(format!("get secret {namespace}/{name}: {e}")))?
            .ok_or_else(|| CsiError::InvalidArgument(format!("secret {namespace}/{name} not found")))?;
        merged.extend(req.secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(merged)
    }

    async fn publish_locked(
        &self,
        req: &NodePublishVolumeRequest,
        plan: PublishPlan,
    ) -> Result<(), CsiError> {
        let volume_id = &req.volume_id;
        let target = Path::new(&req.target_path);

        let pv = self.fetch_persistent_volume(volume_id).await;

        self.provider
            .create_target(target)
            .await
            .map_err(|e| CsiError::Internal(format!("Could not create dir {target:?}: {e}")))?;

        let options = settings::effective_mount_options(
            &req.volume_context,
            &plan.capability,
            req.read_only,
            &req.mount_flags,
        );
        let secrets = self.publish_secrets(req).await?;
        let settings = settings::resolve(volume_id, &secrets, &req.volume_context, &options)?;
        debug!(?settings, "mount settings resolved");

        let session = self
            .provider
            .ensure_session(&settings, volume_id, target)
            .await
            .map_err(|e| CsiError::Internal(format!("Could not mount filesystem: {e}")))?;

        let source = match self
            .provider
            .create_volume_dir(&session, &settings.sub_path)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                self.abandon(&session, target).await;
                return Err(CsiError::Internal(format!(
                    "Could not create volume {volume_id}: {e}"
                )));
            }
        };

        if let Err(e) = self
            .provider
            .bind(&session, &source, target, settings.is_read_only())
            .await
        {
            self.abandon(&session, target).await;
            return Err(CsiError::Internal(format!(
                "Could not bind {} at {target:?}: {e}",
                source.display()
            )));
        }

        if let Some(requested) = plan.requested_capacity {
            self.apply_quota(volume_id, &session, &settings, pv.as_ref(), requested)
                .await;
        }

        info!(session = %session.key(), refs = session.ref_count(), "volume published");
        Ok(())
    }

    /// Roll back the reference a failed publish took.
    async fn abandon(&self, session: &MountSession, target: &Path) {
        match self.provider.abandon(session, target).await {
            Ok(Some(released)) if released.remaining == 0 => {
                self.provider.schedule_teardown(released.key);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "rollback of failed publish failed"),
        }
    }

    async fn apply_quota(
        &self,
        volume_id: &VolumeId,
        session: &MountSession,
        settings: &MountSettings,
        pv: Option<&PersistentVolume>,
        requested: u64,
    ) {
        let limit_bytes = pv
            .and_then(|pv| pv.capacity_bytes)
            .filter(|c| *c > 0)
            .unwrap_or(requested);

        let path = match settings.quota_path() {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "could not resolve quota path");
                self.record_quota_failure(volume_id, None, limit_bytes, &e);
                return;
            }
        };

        match self.provider.apply_quota(session, &path, limit_bytes).await {
            Ok(()) => {
                self.quota_failures.remove(volume_id);
                info!(%path, limit_bytes, "quota applied");
            }
            Err(e) => {
                error!(%path, limit_bytes, error = %e, "set quota failed");
                self.record_quota_failure(volume_id, Some(path), limit_bytes, &e);
            }
        }
    }

    fn record_quota_failure(
        &self,
        volume_id: &VolumeId,
        path: Option<String>,
        limit_bytes: u64,
        err: &CsiError,
    ) {
        self.quota_failures.insert(
            volume_id.clone(),
            QuotaFailure {
                path,
                limit_bytes,
                reason: err.to_string(),
                at: SystemTime::now(),
            },
        );
    }
}

#[async_trait]
impl CsiIdentity for NodeService {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.plugin_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(tokio::fs::metadata(self.provider.mount_root())
            .await
            .is_ok_and(|m| m.is_dir()))
    }
}

#[async_trait]
impl CsiNode for NodeService {
    async fn stage_volume(&self, _req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeStageVolume".into()))
    }

    async fn unstage_volume(
        &self,
        _volume_id: &VolumeId,
        _staging_target_path: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeUnstageVolume".into()))
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        debug!(request = ?req, "publish volume called");
        let plan = validate_publish(&req)?;
        let result = self
            .with_volume_lock(&req.volume_id, self.publish_locked(&req, plan))
            .await;
        if let Err(e) = &result {
            error!(error = %e, "publish volume failed");
            if e.code() == Code::Internal {
                self.metrics.inc_volume_errors();
            }
        }
        result
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("Volume ID not provided".into()));
        }
        if target_path.is_empty() {
            return Err(CsiError::InvalidArgument("Target path not provided".into()));
        }

        let result = self
            .with_volume_lock(volume_id, async {
                let released = self
                    .provider
                    .unbind(Path::new(target_path))
                    .await
                    .map_err(|e| {
                        CsiError::Internal(format!("Could not unmount {target_path:?}: {e}"))
                    })?;
                match released {
                    Some(released) if released.remaining == 0 => {
                        debug!(session = %released.key, "last consumer gone, scheduling teardown");
                        self.provider.schedule_teardown(released.key);
                    }
                    Some(released) => {
                        debug!(session = %released.key, refs = released.remaining, "session still in use");
                    }
                    None => debug!("target was not published"),
                }
                Ok::<(), CsiError>(())
            })
            .await;

        if let Err(e) = &result {
            error!(error = %e, "unpublish volume failed");
            self.metrics.inc_volume_del_errors();
        }
        result
    }

    async fn expand_volume(&self, _req: NodeExpandVolumeRequest) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("NodeExpandVolume".into()))
    }

    #[instrument(skip(self))]
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("Volume ID not provided".into()));
        }
        if volume_path.is_empty() {
            return Err(CsiError::InvalidArgument("Volume path not provided".into()));
        }
        let path = Path::new(volume_path);
        let bound = self.config.check_timeout;

        let exists = do_with_timeout(
            "volume path check",
            bound,
            util::path_exists(self.mounter.as_ref(), path),
        )
        .await
        .map_err(|e| CsiError::Internal(format!("Check volume path {volume_path:?}: {e}")))?;
        if !exists {
            return Err(CsiError::NotFound(format!(
                "Volume path {volume_path:?} not exists"
            )));
        }

        if self.config.check_mountpoint {
            let mounted = do_with_timeout(
                "mount point check",
                bound,
                self.mounter.is_mountpoint(path),
            )
            .await
            .map_err(|e| CsiError::Internal(format!("Check volume path {volume_path:?}: {e}")))?;
            if !mounted {
                return Err(CsiError::Internal(format!(
                    "Volume path {volume_path:?} not mounted"
                )));
            }
        }

        let usage = util::disk_usage(path).await?;
        let (total, available) = (to_i64(usage.total_bytes), to_i64(usage.free_bytes));
        let (total_inodes, free_inodes) = (to_i64(usage.total_inodes), to_i64(usage.free_inodes));
        Ok(VolumeStats {
            usage: vec![
                VolumeUsage {
                    available,
                    total,
                    used: total - available,
                    unit: UsageUnit::Bytes,
                },
                VolumeUsage {
                    available: free_inodes,
                    total: total_inodes,
                    used: total_inodes - free_inodes,
                    unit: UsageUnit::Inodes,
                },
            ],
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::GetVolumeStats])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
        })
    }
}
