//! Tunables of the node service and the volume reconciler.
//!
//! Both structs deserialize from YAML with every field optional; durations
//! use human-readable strings such as `30s` or `500ms`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default plugin (and driver) name.
pub const DEFAULT_PLUGIN_NAME: &str = "dfs.csi.rk8s.io";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    /// Name reported by `GetPluginInfo`.
    pub plugin_name: String,
    /// Directory holding one mount point per session.
    pub mount_root: PathBuf,
    /// Filesystem tool that runs mount sessions and sets quotas.
    pub mount_binary: PathBuf,
    /// Bound on a mount session becoming ready.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    /// Bound on each existence / mount-point check in `GetVolumeStats`.
    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,
    /// How long an unreferenced session lives before it is stopped.
    #[serde(with = "humantime_serde")]
    pub teardown_grace: Duration,
    /// Whether `GetVolumeStats` requires the path to be a mount point.
    pub check_mountpoint: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_PLUGIN_NAME.to_owned(),
            mount_root: PathBuf::from("/var/lib/rkcsi/mnt"),
            mount_binary: PathBuf::from("/usr/local/bin/juicefs"),
            startup_timeout: Duration::from_secs(30),
            check_timeout: Duration::from_secs(2),
            teardown_grace: Duration::from_secs(30),
            check_mountpoint: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// CSI driver whose volume objects this node tracks.
    pub driver_name: String,
    /// Interval of full relists.
    #[serde(with = "humantime_serde")]
    pub resync_interval: Duration,
    /// First retry delay of a failed reconcile; doubles per failure.
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Consecutive failed relists after which the loop gives up.
    pub max_list_failures: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_PLUGIN_NAME.to_owned(),
            resync_interval: Duration::from_secs(60),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            max_list_failures: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: NodeConfig = serde_yaml::from_str(
            "mount_root: /tmp/mnt\nstartup_timeout: 5s\ncheck_timeout: 250ms\n",
        )
        .unwrap();
        assert_eq!(cfg.mount_root, PathBuf::from("/tmp/mnt"));
        assert_eq!(cfg.startup_timeout, Duration::from_secs(5));
        assert_eq!(cfg.check_timeout, Duration::from_millis(250));
        assert_eq!(cfg.teardown_grace, Duration::from_secs(30));
        assert!(cfg.check_mountpoint);
    }

    #[test]
    fn reconciler_defaults() {
        let cfg: ReconcilerConfig = serde_yaml::from_str("backoff_max: 1m\n").unwrap();
        assert_eq!(cfg.backoff_max, Duration::from_secs(60));
        assert_eq!(cfg.backoff_base, Duration::from_millis(500));
        assert_eq!(cfg.driver_name, DEFAULT_PLUGIN_NAME);
    }
}
