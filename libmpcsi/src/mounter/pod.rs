use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::Mounter;
use crate::config::MountpointPodPaths;
use crate::credential::{MountCredentials, token_file_name, write_token};
use crate::error::CsiError;
use crate::lock::MountpointPodLocks;
use crate::mount::args::READ_ONLY;
use crate::mount::{Mount, MountArgs, is_not_found};
use crate::mppod::Watcher;
use crate::targetpath::TargetPath;

/// Where the communication directory is mounted inside a Mountpoint Pod.
pub const MOUNTPOINT_POD_COMM_DIR: &str = "/comm";
/// Mount request file read by the Mountpoint Pod.
pub const MOUNT_OPTIONS_FILE: &str = "mount-options.json";

const SOURCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Mount request handed to a Mountpoint Pod through its communication
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountOptions {
    pub bucket_name: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// [`Mounter`] that delegates the bucket mount to the volume's Mountpoint Pod
/// and bind-mounts the pod's source directory onto the workload target.
pub struct PodMounter {
    watcher: Arc<Watcher>,
    mount: Arc<dyn Mount>,
    locks: MountpointPodLocks,
    paths: MountpointPodPaths,
    mount_timeout: Duration,
}

impl PodMounter {
    /// * `watcher`: started watcher of this node's Mountpoint Pods
    /// * `locks`: the registry shared with [`PodUnmounter`](super::PodUnmounter)
    /// * `mount_timeout`: bound on waiting for the pod, and then for its
    ///   source mount
    pub fn new(
        watcher: Arc<Watcher>,
        mount: Arc<dyn Mount>,
        locks: MountpointPodLocks,
        paths: MountpointPodPaths,
        mount_timeout: Duration,
    ) -> Self {
        Self {
            watcher,
            mount,
            locks,
            paths,
            mount_timeout,
        }
    }

    async fn wait_for_source(&self, source: &Path) -> Result<(), CsiError> {
        let deadline = Instant::now() + self.mount_timeout;
        loop {
            match self.mount.is_mount_point(source).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => debug!(source = %source.display(), error = %e, "source mount check failed"),
            }
            if Instant::now() >= deadline {
                return Err(CsiError::MountFailed {
                    path: source.display().to_string(),
                    reason: format!(
                        "Mountpoint Pod did not mount the bucket within {:?}",
                        self.mount_timeout
                    ),
                });
            }
            tokio::time::sleep(SOURCE_POLL_INTERVAL).await;
        }
    }
}

fn mount_failed(target: &str, reason: impl ToString) -> CsiError {
    CsiError::MountFailed {
        path: target.to_owned(),
        reason: reason.to_string(),
    }
}

async fn write_mount_options(comm_dir: &Path, options: &MountOptions) -> io::Result<()> {
    tokio::fs::create_dir_all(comm_dir).await?;
    let body = serde_json::to_vec_pretty(options)?;
    let path = comm_dir.join(MOUNT_OPTIONS_FILE);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, &path).await
}

#[async_trait]
impl Mounter for PodMounter {
    #[instrument(skip(self, credentials, args), fields(args = %args))]
    async fn mount(
        &self,
        bucket_name: &str,
        target: &str,
        credentials: &MountCredentials,
        args: &MountArgs,
    ) -> Result<(), CsiError> {
        let target_path = TargetPath::parse(target)?;
        let volume_id = target_path.volume_id.as_str();

        match self.mount.is_mount_point(Path::new(target)).await {
            Ok(true) => {
                debug!(target, "target already mounted, assuming idempotent retry");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) if is_not_found(&e) => {
                tokio::fs::create_dir_all(target)
                    .await
                    .map_err(|e| mount_failed(target, format!("create target: {e}")))?;
            }
            Err(e) => return Err(mount_failed(target, e)),
        }

        let pod = self
            .watcher
            .wait_for(self.mount_timeout, |pod| {
                pod.is_live() && pod.volume_id() == Some(volume_id)
            })
            .await
            .ok_or_else(|| {
                mount_failed(
                    target,
                    format!(
                        "no Mountpoint Pod for volume {volume_id} on node {}",
                        self.watcher.node_name()
                    ),
                )
            })?;

        let _guard = self.locks.lock(&pod.uid).await;
        // The pod may have been marked for unmount while we waited.
        let pod = match self.watcher.get(&pod.uid) {
            Some(current) if current.is_live() => current,
            _ => {
                return Err(mount_failed(
                    target,
                    format!("Mountpoint Pod {} is going away", pod.uid),
                ));
            }
        };
        let comm_dir = self.paths.comm_dir(&pod.uid);

        let pod_token_path = match &credentials.token_path {
            Some(token_path) => {
                let name = token_file_name(&pod.uid, volume_id);
                let token = tokio::fs::read_to_string(token_path)
                    .await
                    .map_err(|e| CsiError::credential(format!("read {}: {e}", token_path.display())))?;
                write_token(&comm_dir.join(&name), &token)
                    .await
                    .map_err(|e| CsiError::credential(format!("copy token to {}: {e}", comm_dir.display())))?;
                Some(PathBuf::from(MOUNTPOINT_POD_COMM_DIR).join(name))
            }
            None => None,
        };

        let source = self.paths.source_dir(&pod.uid);
        let source_mounted = match self.mount.is_mount_point(&source).await {
            Ok(mounted) => mounted,
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                warn!(source = %source.display(), error = %e, "source mount check failed");
                false
            }
        };
        if !source_mounted {
            let options = MountOptions {
                bucket_name: bucket_name.to_owned(),
                args: args.to_vec(),
                env: credentials.env(pod_token_path.as_deref()),
            };
            write_mount_options(&comm_dir, &options)
                .await
                .map_err(|e| mount_failed(target, format!("send mount options: {e}")))?;
            debug!(uid = %pod.uid, "mount options sent to Mountpoint Pod");
            self.wait_for_source(&source).await?;
        }

        let read_only = args.contains(READ_ONLY);
        self.mount
            .bind_mount(&source, Path::new(target), read_only)
            .await
            .map_err(|e| mount_failed(target, e))?;

        info!(
            target,
            uid = %pod.uid,
            volume_id,
            read_only,
            "volume published (bind-mount)",
        );
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        self.mount
            .unmount(Path::new(target))
            .await
            .map_err(|e| CsiError::UnmountFailed {
                path: target.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn is_mount_point(&self, target: &str) -> io::Result<bool> {
        self.mount.is_mount_point(Path::new(target)).await
    }
}
