mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cli::{Cli, Commands};
use config::{Config, LogFormat, TlsConfig, load_config};
use gethostname::gethostname;
use libcsi::transport::server::CsiServer;
use libcsi::{
    ClusterClient, LinuxMounter, LoopHealth, MountProvider, NodeMetrics, NodeService,
    ProcessMountBackend, VolumeReconciler, XlineClusterClient, mount::Mounter,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            node_id,
            addr,
        } => {
            let mut cfg = load_config(&config)?;
            if let Some(addr) = addr {
                cfg.addr = addr;
            }
            init_tracing(cfg.log_format)?;
            let node_id = node_id
                .or_else(|| cfg.node_id.clone())
                .unwrap_or_else(|| gethostname().to_string_lossy().into_owned());
            run(cfg, node_id).await
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create log filter")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

/// TLS config from the configured PEM files, or a self-signed certificate
/// for `localhost`.
fn server_tls(tls: Option<&TlsConfig>) -> Result<rustls::ServerConfig> {
    let (certs, key) = match tls {
        Some(tls) => {
            let certs = CertificateDer::pem_file_iter(&tls.cert)
                .with_context(|| format!("Failed to read {}", tls.cert.display()))?
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to parse {}", tls.cert.display()))?;
            let key = PrivateKeyDer::from_pem_file(&tls.key)
                .with_context(|| format!("Failed to read {}", tls.key.display()))?;
            (certs, key)
        }
        None => {
            warn!("no TLS material configured, using a self-signed certificate");
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
            let cert_der = CertificateDer::from(cert.serialize_der()?);
            let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
            (vec![cert_der], PrivateKeyDer::Pkcs8(key))
        }
    };
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS certificate")
}

/// Resolves with the failure message once the reconciler reports one.
async fn reconciler_failure(health: Option<watch::Receiver<LoopHealth>>) -> String {
    if let Some(mut health) = health
        && let Ok(state) = health
            .wait_for(|h| matches!(h, LoopHealth::Failed(_)))
            .await
        && let LoopHealth::Failed(msg) = &*state
    {
        return msg.clone();
    }
    std::future::pending().await
}

async fn run(cfg: Config, node_id: String) -> Result<()> {
    if CryptoProvider::install_default(rustls::crypto::ring::default_provider()).is_err() {
        warn!("crypto provider already installed");
    }

    tokio::fs::create_dir_all(&cfg.node.mount_root)
        .await
        .with_context(|| format!("Failed to create {}", cfg.node.mount_root.display()))?;

    let mounter: Arc<dyn Mounter> = Arc::new(LinuxMounter);
    let backend = Arc::new(ProcessMountBackend::new(
        &cfg.node.mount_binary,
        Arc::clone(&mounter),
    ));
    let provider = Arc::new(MountProvider::new(&cfg.node, backend, Arc::clone(&mounter)));
    let metrics = NodeMetrics::new();
    let mut service = NodeService::new(
        node_id.clone(),
        cfg.node.clone(),
        Arc::clone(&provider),
        mounter,
    )
    .with_metrics(metrics.clone());

    let cancel = CancellationToken::new();
    let mut reconciler = None;
    match &cfg.xline_config {
        Some(xline) => {
            let cluster: Arc<dyn ClusterClient> = Arc::new(
                XlineClusterClient::connect(&xline.endpoints, &xline.prefix)
                    .await
                    .context("Failed to connect to xline")?,
            );
            service = service.with_cluster(Arc::clone(&cluster));
            let volume_reconciler = Arc::new(VolumeReconciler::new(
                node_id.clone(),
                cfg.reconciler.clone(),
                cluster,
                Arc::clone(&provider),
            ));
            reconciler = Some(volume_reconciler.spawn(cancel.child_token()));
        }
        None => warn!("no xline_config, volume reconciler disabled"),
    }

    let server = CsiServer::new(cfg.addr, server_tls(cfg.tls.as_ref())?, Arc::new(service))?
        .with_metrics(metrics);
    info!(%node_id, addr = %cfg.addr, "rkcsi node plugin started");

    let failure = reconciler_failure(reconciler.as_ref().map(|h| h.health.clone()));
    let outcome = tokio::select! {
        res = server.serve() => res.context("CSI server stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
        msg = failure => Err(anyhow!("volume reconciler failed: {msg}")),
    };

    cancel.cancel();
    server
        .endpoint()
        .close(quinn::VarInt::from_u32(0), b"shutdown");
    if let Some(handle) = reconciler
        && let Err(e) = handle.task.await
    {
        warn!(error = %e, "volume reconciler task aborted");
    }

    outcome
}
