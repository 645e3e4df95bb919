//! # libcsi — distributed-filesystem CSI node plugin for RK8s
//!
//! `libcsi` publishes volumes backed by a shared distributed filesystem into
//! workloads on a worker node.  Volumes whose mount settings differ only in
//! their sub-path share one long-running mount session; each volume is a
//! directory inside that session, bind-mounted at the workload's target path.
//! Requests arrive as [`CsiMessage`]s over QUIC (via [`quinn`]) and follow
//! the RK8s conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeId`, capabilities, requests, usage. |
//! | [`error`] | [`CsiError`] enum and the RPC status [`Code`]s it maps to. |
//! | [`config`] | [`NodeConfig`] / [`ReconcilerConfig`] tunables. |
//! | [`settings`] | Resolution of request data into [`MountSettings`]. |
//! | [`mount`] | Host mounts, the mount process and the [`MountProvider`]. |
//! | [`service`] | [`NodeService`] — publish, unpublish, stats. |
//! | [`cluster`] | [`ClusterClient`] — volume objects and secrets in Xline. |
//! | [`reconciler`] | [`VolumeReconciler`] — background cleanup and status. |
//! | [`metrics`] | [`NodeMetrics`] failure counters. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait — publish, unpublish, stats. |
//! | [`transport`] | QUIC client/server built on `quinn`. |

pub mod cluster;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod reconciler;
pub mod service;
pub mod settings;
pub mod transport;
pub mod types;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the most commonly used items at crate root for convenience.
pub use cluster::{ClusterClient, ClusterError, XlineClusterClient};
pub use config::{NodeConfig, ReconcilerConfig};
pub use error::{Code, CsiError};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use metrics::NodeMetrics;
pub use mount::{LinuxMounter, MountProvider, ProcessMountBackend};
pub use node::CsiNode;
pub use reconciler::{LoopHealth, ReconcilerHandle, VolumeReconciler};
pub use service::NodeService;
pub use settings::{MountSettings, SessionKey};
pub use types::*;
