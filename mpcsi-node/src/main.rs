//! mpcsi-node - node daemon of the Mountpoint Pod CSI plugin.
//!
//! Builds the per-pod lock registry once and shares it between the pod
//! unmounter and the publish path, sweeps mounts left behind by a previous
//! run, then serves node RPCs over QUIC until interrupted.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use libmpcsi::credential::{CredentialProvider, FileCredentialProvider, region_from_env};
use libmpcsi::mount::{LinuxMount, Mount};
use libmpcsi::mppod::KubePodSource;
use libmpcsi::transport::CsiServer;
use libmpcsi::{MountpointPodLocks, NodeConfig, NodeServer, PodMounter, PodUnmounter, Watcher};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "mpcsi-node", version, about = "CSI node plugin serving buckets through Mountpoint Pods", long_about = None)]
struct Args {
    /// Name of the node this plugin runs on
    #[arg(long, env = "CSI_NODE_NAME")]
    node_id: String,

    /// QUIC listen address for node RPCs
    #[arg(long, default_value = "0.0.0.0:7443")]
    listen: SocketAddr,

    /// PEM certificate chain presented to the node agent
    #[arg(long)]
    tls_cert: PathBuf,

    /// PEM private key of the certificate
    #[arg(long)]
    tls_key: PathBuf,

    /// Kubelet state directory [env: KUBELET_PATH]
    #[arg(long)]
    kubelet_path: Option<PathBuf>,

    /// Namespace Mountpoint Pods run in [env: MOUNTPOINT_NAMESPACE]
    #[arg(long)]
    mountpoint_namespace: Option<String>,

    /// Directory holding one source mount per Mountpoint Pod [env: SOURCE_MOUNT_ROOT]
    #[arg(long)]
    source_mount_root: Option<PathBuf>,

    /// Directory workload tokens are written to [env: CONTAINER_PLUGIN_DIR]
    #[arg(long)]
    container_plugin_dir: Option<PathBuf>,

    /// Seconds between full resyncs of the pod cache
    #[arg(long)]
    resync_period_secs: Option<u64>,

    /// Seconds the pod cache may take to sync on start-up
    #[arg(long)]
    sync_timeout_secs: Option<u64>,

    /// Seconds publish waits for a Mountpoint Pod and its mount
    #[arg(long)]
    mount_timeout_secs: Option<u64>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Environment configuration with the flags given on the command line
    /// applied on top.
    fn config(&self) -> NodeConfig {
        let mut config = NodeConfig::from_env(self.node_id.clone());
        if let Some(kubelet_path) = &self.kubelet_path {
            let mut rooted = NodeConfig::with_kubelet_path(self.node_id.clone(), kubelet_path.clone());
            rooted.mountpoint_namespace = config.mountpoint_namespace;
            config = rooted;
        }
        if let Some(namespace) = &self.mountpoint_namespace {
            config.mountpoint_namespace = namespace.clone();
        }
        if let Some(root) = &self.source_mount_root {
            config.source_mount_root = root.clone();
        }
        if let Some(dir) = &self.container_plugin_dir {
            config.container_plugin_dir = dir.clone();
        }
        if let Some(secs) = self.resync_period_secs {
            config.resync_period = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sync_timeout_secs {
            config.sync_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.mount_timeout_secs {
            config.mount_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_tls(cert: &Path, key: &Path) -> anyhow::Result<rustls::ServerConfig> {
    let certs = CertificateDer::pem_file_iter(cert)
        .with_context(|| format!("open certificate {}", cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate {}", cert.display()))?;
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("load private key {}", key.display()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    // Another dependency may have installed a provider already.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = args.config();
    info!(?config, "starting mpcsi-node");
    let tls = load_tls(&args.tls_cert, &args.tls_key)?;

    let client = kube::Client::try_default()
        .await
        .context("build Kubernetes client")?;
    let source = Arc::new(KubePodSource::new(
        client,
        &config.mountpoint_namespace,
        &config.node_id,
    ));
    let watcher = Arc::new(
        Watcher::new(
            source,
            &config.mountpoint_namespace,
            &config.node_id,
            config.resync_period,
        )
        .with_sync_timeout(config.sync_timeout),
    );

    let locks = MountpointPodLocks::new();
    let paths = config.paths();
    let mount: Arc<dyn Mount> = Arc::new(LinuxMount::new());
    let credentials: Arc<dyn CredentialProvider> = Arc::new(FileCredentialProvider::new(
        &config.container_plugin_dir,
        Arc::new(region_from_env),
    ));

    let unmounter = Arc::new(PodUnmounter::new(
        &config.node_id,
        Arc::clone(&mount),
        Arc::clone(&watcher),
        Arc::clone(&credentials),
        locks.clone(),
        paths.clone(),
    ));
    watcher.add_handler(unmounter.clone());

    let stop = CancellationToken::new();
    watcher
        .start(stop.clone())
        .await
        .context("start Mountpoint Pod watcher")?;

    let report = unmounter
        .cleanup_dangling_mounts()
        .await
        .context("sweep dangling mounts")?;
    for (uid, e) in &report.failed {
        warn!(%uid, error = %e, "dangling mount left in place");
    }

    let mounter = Arc::new(PodMounter::new(
        Arc::clone(&watcher),
        mount,
        locks,
        paths,
        config.mount_timeout,
    ));
    let node = Arc::new(NodeServer::new(&config.node_id, mounter, credentials));
    let server = CsiServer::new(args.listen, tls, node)?;

    tokio::select! {
        res = server.serve() => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
    server.close();
    stop.cancel();
    Ok(())
}
