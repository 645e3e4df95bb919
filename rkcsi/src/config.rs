use anyhow::{Context, Result};
use libcsi::{NodeConfig, ReconcilerConfig};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    /// ip:port the QUIC server listens on
    pub addr: SocketAddr,
    /// Identity of this node; defaults to the hostname
    #[serde(default)]
    pub node_id: Option<String>,
    /// PEM certificate and key; a self-signed pair is generated when absent
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Cluster store; without it no reconciler runs and secrets can only
    /// come with the request
    #[serde(default)]
    pub xline_config: Option<XlineConfig>,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "/registry".to_owned()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "addr: 0.0.0.0:6070").unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.addr.port(), 6070);
        assert!(cfg.xline_config.is_none());
        assert_eq!(cfg.node, NodeConfig::default());
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "\
addr: 127.0.0.1:6070
node_id: worker-1
log_format: json
xline_config:
  endpoints: [\"http://127.0.0.1:2379\"]
node:
  mount_root: /run/rkcsi
  teardown_grace: 10s
reconciler:
  resync_interval: 30s
"
        )
        .unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.node_id.as_deref(), Some("worker-1"));
        assert_eq!(cfg.log_format, LogFormat::Json);
        let xline = cfg.xline_config.unwrap();
        assert_eq!(xline.prefix, "/registry");
        assert_eq!(cfg.node.mount_root, PathBuf::from("/run/rkcsi"));
        assert_eq!(cfg.node.teardown_grace, Duration::from_secs(10));
        assert_eq!(cfg.reconciler.resync_interval, Duration::from_secs(30));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_config(Path::new("/nonexistent/rkcsi.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
