//! Node plugin configuration.
//!
//! Environment variables:
//! - `KUBELET_PATH`: kubelet state directory. Defaults to `/var/lib/kubelet`.
//! - `MOUNTPOINT_NAMESPACE`: namespace Mountpoint Pods are scheduled in.
//!   Defaults to `mount-s3`.
//! - `SOURCE_MOUNT_ROOT`: directory holding one source mount per Mountpoint
//!   Pod UID. Defaults to `<KUBELET_PATH>/plugins/s3.csi.aws.com/mnt`.
//! - `CONTAINER_PLUGIN_DIR`: directory the node plugin writes workload tokens
//!   to. Defaults to `<KUBELET_PATH>/plugins/s3.csi.aws.com`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_KUBELET_PATH: &str = "/var/lib/kubelet";
const DEFAULT_MOUNTPOINT_NAMESPACE: &str = "mount-s3";
const PLUGIN_DIR_NAME: &str = "plugins/s3.csi.aws.com";

/// Runtime configuration of the node plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name of the node this plugin runs on.
    pub node_id: String,
    pub kubelet_path: PathBuf,
    pub mountpoint_namespace: String,
    pub source_mount_root: PathBuf,
    pub container_plugin_dir: PathBuf,
    /// Interval of the watcher's full resynchronization.
    #[serde(with = "secs")]
    pub resync_period: Duration,
    /// How long the watcher may take to fill its cache on start-up.
    #[serde(with = "secs")]
    pub sync_timeout: Duration,
    /// How long publish waits for a Mountpoint Pod and its source mount.
    #[serde(with = "secs")]
    pub mount_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::with_kubelet_path(String::new(), PathBuf::from(DEFAULT_KUBELET_PATH))
    }
}

impl NodeConfig {
    /// Build a configuration rooted at `kubelet_path` with default timings.
    pub fn with_kubelet_path(node_id: String, kubelet_path: PathBuf) -> Self {
        let plugin_dir = kubelet_path.join(PLUGIN_DIR_NAME);
        Self {
            node_id,
            mountpoint_namespace: DEFAULT_MOUNTPOINT_NAMESPACE.to_owned(),
            source_mount_root: plugin_dir.join("mnt"),
            container_plugin_dir: plugin_dir,
            kubelet_path,
            resync_period: Duration::from_secs(10 * 60),
            sync_timeout: Duration::from_secs(30),
            mount_timeout: Duration::from_secs(30),
        }
    }

    /// Read the configuration from the environment, see the module docs.
    pub fn from_env(node_id: String) -> Self {
        let kubelet_path = std::env::var_os("KUBELET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KUBELET_PATH));
        let mut config = Self::with_kubelet_path(node_id, kubelet_path);

        if let Ok(namespace) = std::env::var("MOUNTPOINT_NAMESPACE") {
            config.mountpoint_namespace = namespace;
        }
        if let Some(root) = std::env::var_os("SOURCE_MOUNT_ROOT") {
            config.source_mount_root = PathBuf::from(root);
        }
        if let Some(dir) = std::env::var_os("CONTAINER_PLUGIN_DIR") {
            config.container_plugin_dir = PathBuf::from(dir);
        }
        config
    }

    /// On-disk layout derived from this configuration.
    pub fn paths(&self) -> MountpointPodPaths {
        MountpointPodPaths::new(&self.kubelet_path, &self.source_mount_root)
    }
}

/// Host paths owned by a Mountpoint Pod, keyed by pod UID.
///
/// ```text
/// <kubelet_path>/pods/<uid>/volumes/kubernetes.io~empty-dir/comm   # communication dir
/// <source_mount_root>/<uid>                                         # source mount
/// ```
#[derive(Debug, Clone)]
pub struct MountpointPodPaths {
    kubelet_path: PathBuf,
    source_mount_root: PathBuf,
}

impl MountpointPodPaths {
    pub fn new(kubelet_path: impl AsRef<Path>, source_mount_root: impl AsRef<Path>) -> Self {
        Self {
            kubelet_path: kubelet_path.as_ref().to_path_buf(),
            source_mount_root: source_mount_root.as_ref().to_path_buf(),
        }
    }

    /// Communication directory shared with the Mountpoint Pod, as seen from
    /// the host.
    pub fn comm_dir(&self, uid: &str) -> PathBuf {
        self.kubelet_path
            .join("pods")
            .join(uid)
            .join("volumes/kubernetes.io~empty-dir/comm")
    }

    /// Directory the Mountpoint Pod mounts the bucket on.
    pub fn source_dir(&self, uid: &str) -> PathBuf {
        self.source_mount_root.join(uid)
    }

    pub fn source_mount_root(&self) -> &Path {
        &self.source_mount_root
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
