//! Core CSI types: volumes, capabilities, requests, and usage records.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and the node service.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Mode not set by the caller; never supported.
    Unknown,
    /// Single-node read-write.
    SingleNodeWriter,
    /// Single-node read-only.
    SingleNodeReaderOnly,
    /// Multi-node read-only.
    MultiNodeReaderOnly,
    /// Multi-node, one writer.
    MultiNodeSingleWriter,
    /// Multi-node read-write.
    MultiNodeMultiWriter,
}

/// How the volume is consumed by the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Filesystem mount with optional flags, e.g. `"noatime"`.
    Mount {
        #[serde(default)]
        fs_type: String,
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// Raw block device. This plugin only serves filesystems.
    Block,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type.
    pub access_type: AccessType,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
        }
    }
}

impl VolumeCapability {
    /// Mount flags carried by a mount capability; empty for block.
    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            AccessType::Mount { mount_flags, .. } => mount_flags,
            AccessType::Block => &[],
        }
    }

    /// Whether this capability can be served: a filesystem mount in any known
    /// access mode, with flags that are non-empty and free of separators.
    pub fn is_supported(&self) -> bool {
        if self.access_mode == AccessMode::Unknown {
            return false;
        }
        match &self.access_type {
            AccessType::Block => false,
            AccessType::Mount { mount_flags, .. } => mount_flags.iter().all(|f| {
                let f = f.trim();
                !f.is_empty() && !f.contains(',') && !f.contains(char::is_whitespace)
            }),
        }
    }

    /// Read-only modes force an `ro` mount.
    pub fn is_read_only_mode(&self) -> bool {
        matches!(
            self.access_mode,
            AccessMode::MultiNodeReaderOnly | AccessMode::SingleNodeReaderOnly
        )
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to publish a volume at a workload target path.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Target path the workload sees,
    /// e.g. `/var/lib/rkl/pods/<pod-uid>/volumes/<vol-name>`.
    pub target_path: String,
    /// Requested capability. Required.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Opaque context from the volume object or storage class
    /// (`mountOptions`, `subPath`, `capacity`, ...).
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Node-publish secrets.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// Extra caller-supplied mount flags, appended last.
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Requested capacity, used when the context carries no `capacity`.
    #[serde(default)]
    pub capacity_bytes: Option<i64>,
}

// Secrets must never reach logs, so only their keys are printed.
impl fmt::Debug for NodePublishVolumeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secret_keys: Vec<&String> = self.secrets.keys().collect();
        secret_keys.sort();
        f.debug_struct("NodePublishVolumeRequest")
            .field("volume_id", &self.volume_id)
            .field("target_path", &self.target_path)
            .field("volume_capability", &self.volume_capability)
            .field("read_only", &self.read_only)
            .field("volume_context", &self.volume_context)
            .field("secrets", &secret_keys)
            .field("mount_flags", &self.mount_flags)
            .field("capacity_bytes", &self.capacity_bytes)
            .finish()
    }
}

/// Request to stage a volume. Accepted on the wire but never served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    pub staging_target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to expand a published volume. Accepted on the wire but never served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    pub volume_path: String,
    #[serde(default)]
    pub capacity_bytes: Option<i64>,
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Unit of a [`VolumeUsage`] record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

/// One usage record as returned by `GetVolumeStats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub available: i64,
    pub total: i64,
    pub used: i64,
    pub unit: UsageUnit,
}

/// Usage of a published volume: one bytes record and one inodes record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub usage: Vec<VolumeUsage>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"dfs.csi.rk8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin as a whole. Every one of them
/// describes a controller-side service, so a node plugin has none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {}

/// RPCs the node service advertises beyond the mandatory ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    GetVolumeStats,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
}
