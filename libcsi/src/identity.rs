//! Plugin identity: name, version and readiness.
//!
//! The container runtime calls these before routing any volume to the node
//! plugin, so they must stay cheap and must not touch the cluster store.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Registered plugin name and the crate version serving it.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// `Ok(false)` means the plugin is up but cannot publish volumes yet.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Node-only plugins advertise nothing here.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(Vec::new())
    }
}
