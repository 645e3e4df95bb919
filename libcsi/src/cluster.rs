//! Read access to the cluster's persistent-volume objects and secrets.
//!
//! The node only needs a narrow view of the cluster store:
//!
//! * the persistent volume behind a volume ID (capacity, phase, annotations),
//! * the names of all persistent volumes, for resync,
//! * secrets referenced from a volume context,
//! * annotation patches on persistent volumes.
//!
//! [`XlineClusterClient`] reads these from the RKS store, where each object
//! is a YAML document under `<prefix>/<kind>/...`:
//!
//! ```text
//! /registry/persistentvolumes/<name>
//! /registry/secrets/<namespace>/<name>
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::VolumeId;

const PATCH_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The stored object cannot be decoded. Retrying will not help.
    #[error("object {key} is malformed: {reason}")]
    Malformed { key: String, reason: String },

    #[error("cluster store unavailable: {0}")]
    Unavailable(String),

    #[error("concurrent updates to {0}, giving up")]
    Conflict(String),

    #[error("xline error: {0}")]
    Xline(#[from] Box<etcd_client::Error>),
}

impl From<etcd_client::Error> for ClusterError {
    fn from(err: etcd_client::Error) -> Self {
        ClusterError::Xline(Box::new(err))
    }
}

impl ClusterError {
    /// Whether the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ClusterError::Malformed { .. })
    }
}

/// Lifecycle phase of a persistent volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumePhase {
    #[default]
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

/// The parts of a persistent-volume object this node reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistentVolume {
    pub name: String,
    /// Declared capacity; takes precedence over a requested capacity.
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    /// CSI driver serving the volume.
    #[serde(default)]
    pub driver: Option<String>,
    /// Volume ID handed to the node; defaults to the object name.
    #[serde(default)]
    pub volume_handle: Option<String>,
    #[serde(default)]
    pub phase: VolumePhase,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl PersistentVolume {
    pub fn volume_id(&self) -> VolumeId {
        VolumeId::from(self.volume_handle.as_deref().unwrap_or(&self.name))
    }

    /// Apply an annotation patch; `None` values delete the key.
    /// Returns whether anything changed.
    pub fn apply_annotations(&mut self, patch: &BTreeMap<String, Option<String>>) -> bool {
        let mut changed = false;
        for (key, value) in patch {
            changed |= match value {
                Some(v) => self.annotations.insert(key.clone(), v.clone()).as_ref() != Some(v),
                None => self.annotations.remove(key).is_some(),
            };
        }
        changed
    }
}

#[derive(Debug, Default, Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: HashMap<String, String>,
}

/// Cluster store operations used by the node service and reconciler.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a persistent volume by name; `None` if it does not exist.
    async fn get_persistent_volume(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolume>, ClusterError>;

    async fn list_persistent_volume_names(&self) -> Result<Vec<String>, ClusterError>;

    /// Data of a secret; `None` if it does not exist.
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HashMap<String, String>>, ClusterError>;

    /// Patch annotations of a persistent volume. A missing volume is not an
    /// error.
    async fn patch_volume_annotations(
        &self,
        name: &str,
        patch: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ClusterError>;
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, bytes: &[u8]) -> Result<T, ClusterError> {
    serde_yaml::from_slice(bytes).map_err(|e| ClusterError::Malformed {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

/// [`ClusterClient`] backed by the RKS Xline store.
#[derive(Clone)]
pub struct XlineClusterClient {
    client: Arc<RwLock<Client>>,
    prefix: String,
}

impl XlineClusterClient {
    pub async fn connect(endpoints: &[String], prefix: &str) -> Result<Self, ClusterError> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            prefix: prefix.trim_end_matches('/').to_owned(),
        })
    }

    fn volumes_prefix(&self) -> String {
        format!("{}/persistentvolumes/", self.prefix)
    }

    fn volume_key(&self, name: &str) -> String {
        format!("{}{name}", self.volumes_prefix())
    }

    fn secret_key(&self, namespace: &str, name: &str) -> String {
        format!("{}/secrets/{namespace}/{name}", self.prefix)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>, ClusterError> {
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision())))
    }
}

#[async_trait]
impl ClusterClient for XlineClusterClient {
    async fn get_persistent_volume(
        &self,
        name: &str,
    ) -> Result<Option<PersistentVolume>, ClusterError> {
        let key = self.volume_key(name);
        match self.get_raw(&key).await? {
            Some((value, _)) => decode(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    async fn list_persistent_volume_names(&self) -> Result<Vec<String>, ClusterError> {
        let prefix = self.volumes_prefix();
        let mut client = self.client.write().await;
        let resp = client
            .get(
                prefix.clone(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.key()).replace(&prefix, ""))
            .collect())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HashMap<String, String>>, ClusterError> {
        let key = self.secret_key(namespace, name);
        match self.get_raw(&key).await? {
            Some((value, _)) => decode::<SecretObject>(&key, &value).map(|s| Some(s.data)),
            None => Ok(None),
        }
    }

    async fn patch_volume_annotations(
        &self,
        name: &str,
        patch: &BTreeMap<String, Option<String>>,
    ) -> Result<(), ClusterError> {
        let key = self.volume_key(name);
        for _ in 0..PATCH_ATTEMPTS {
            let Some((value, revision)) = self.get_raw(&key).await? else {
                debug!(volume = name, "volume gone, skipping annotation patch");
                return Ok(());
            };
            let mut pv: PersistentVolume = decode(&key, &value)?;
            if !pv.apply_annotations(patch) {
                return Ok(());
            }
            let yaml = serde_yaml::to_string(&pv).map_err(|e| ClusterError::Malformed {
                key: key.clone(),
                reason: e.to_string(),
            })?;

            // Compare-and-swap on the revision read above.
            let txn = Txn::new()
                .when([Compare::mod_revision(
                    key.clone(),
                    CompareOp::Equal,
                    revision,
                )])
                .and_then([TxnOp::put(key.clone(), yaml, None)]);
            let resp = self.client.write().await.txn(txn).await?;
            if resp.succeeded() {
                return Ok(());
            }
            debug!(volume = name, "annotation patch raced, retrying");
        }
        Err(ClusterError::Conflict(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PV_YAML: &str = "\
name: pv-1
capacity_bytes: 1073741824
driver: dfs.csi.rk8s.io
phase: Bound
annotations:
  owner: team-a
";

    #[test]
    fn decodes_volume_objects() {
        let pv: PersistentVolume = decode("/registry/persistentvolumes/pv-1", PV_YAML.as_bytes())
            .unwrap();
        assert_eq!(pv.capacity_bytes, Some(1 << 30));
        assert_eq!(pv.phase, VolumePhase::Bound);
        assert_eq!(pv.volume_id(), VolumeId::from("pv-1"));
    }

    #[test]
    fn undecodable_objects_are_terminal() {
        let err = decode::<PersistentVolume>("k", b"name: [unterminated").unwrap_err();
        assert!(matches!(err, ClusterError::Malformed { .. }));
        assert!(!err.is_transient());
        assert!(ClusterError::Unavailable("connection refused".into()).is_transient());
    }

    #[test]
    fn annotation_patch_reports_changes() {
        let mut pv = PersistentVolume {
            name: "pv-1".into(),
            ..Default::default()
        };
        let set = BTreeMap::from([("mounted.node-a".to_owned(), Some("1".to_owned()))]);
        assert!(pv.apply_annotations(&set));
        assert!(!pv.apply_annotations(&set));

        let clear = BTreeMap::from([("mounted.node-a".to_owned(), None)]);
        assert!(pv.apply_annotations(&clear));
        assert!(pv.annotations.is_empty());
        assert!(!pv.apply_annotations(&clear));
    }

    #[test]
    fn secret_data_defaults_to_empty() {
        let s: SecretObject = decode("k", b"kind: Secret\n").unwrap();
        assert!(s.data.is_empty());
    }
}
