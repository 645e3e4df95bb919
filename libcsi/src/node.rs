//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a shared distributed
//! filesystem available to workloads:
//!
//! 1. **Publish** — ensure a mount session for the volume's settings, create
//!    the volume directory inside it and bind it at the target path.
//! 2. **Unpublish** — remove the bind and release the session reference.
//! 3. **GetVolumeStats** — report bytes and inodes of a published path.
//!
//! Staging and expansion are not offered; the corresponding calls report
//! `Unimplemented`.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, VolumeId, VolumeStats,
};

/// Node service — local publish / unpublish operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume at `req.target_path`.
    ///
    /// Idempotent: publishing an already-published target succeeds
    /// without binding it again.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`.
    ///
    /// Idempotent: an absent bind succeeds.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<(), CsiError>;

    /// Usage of the filesystem at `volume_path`.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
