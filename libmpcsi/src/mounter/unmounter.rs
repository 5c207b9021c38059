//! Pod Unmount Reconciler.
//!
//! Tears down the source mount of a Mountpoint Pod once the pod is annotated
//! with [`ANNOTATION_NEEDS_UNMOUNT`](crate::mppod::ANNOTATION_NEEDS_UNMOUNT),
//! and on start-up of every source mount whose pod is gone.
//!
//! Cleanup of one pod UID always runs under that UID's lock, so it never
//! interleaves with a publish for the same pod.  Each step is best-effort:
//! a failed unmount is reported but the credentials and directories are still
//! removed.  Failed cleanups are not retried here; the next update, resync or
//! restart triggers them again.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::config::MountpointPodPaths;
use crate::credential::{CleanupContext, CredentialProvider};
use crate::error::CsiError;
use crate::lock::MountpointPodLocks;
use crate::mount::{Mount, is_not_found};
use crate::mppod::{MountpointPod, PodEventHandler, Watcher};

/// Outcome of [`PodUnmounter::cleanup_dangling_mounts`].
#[derive(Debug, Default)]
pub struct SweepReport {
    /// UIDs whose resources were fully removed.
    pub cleaned: Vec<String>,
    /// UIDs whose cleanup reported an error, with the first error.
    pub failed: Vec<(String, CsiError)>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Unmounts Mountpoint Pods that are marked for unmount or gone.
pub struct PodUnmounter {
    node_name: String,
    mount: Arc<dyn Mount>,
    watcher: Arc<Watcher>,
    credentials: Arc<dyn CredentialProvider>,
    locks: MountpointPodLocks,
    paths: MountpointPodPaths,
}

impl PodUnmounter {
    pub fn new(
        node_name: impl Into<String>,
        mount: Arc<dyn Mount>,
        watcher: Arc<Watcher>,
        credentials: Arc<dyn CredentialProvider>,
        locks: MountpointPodLocks,
        paths: MountpointPodPaths,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            mount,
            watcher,
            credentials,
            locks,
            paths,
        }
    }

    /// React to one pod state change.  Only the current state matters, so a
    /// repeated or resynced notification triggers the same idempotent
    /// cleanup.  A deletion is judged by the last state seen, so a pod that
    /// was marked for unmount still gets its cleanup retried when it goes.
    pub async fn handle_update(&self, old: Option<&MountpointPod>, new: Option<&MountpointPod>) {
        let Some(pod) = new.or(old) else {
            return;
        };
        if pod.node_name != self.node_name {
            return;
        }
        if !pod.needs_unmount() {
            return;
        }

        if let Err(e) = self.unmount_and_cleanup(&pod.uid, pod.volume_id()).await {
            error!(uid = %pod.uid, error = %e, "failed to clean up Mountpoint Pod");
        }
    }

    /// Clean up every source mount whose Mountpoint Pod is missing,
    /// terminating or marked for unmount.
    ///
    /// Failures are collected per UID; only failing to enumerate the source
    /// mount root is returned as an error.
    pub async fn cleanup_dangling_mounts(&self) -> Result<SweepReport, CsiError> {
        let root = self.paths.source_mount_root();
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if is_not_found(&e) => {
                debug!(root = %root.display(), "source mount root absent, nothing to sweep");
                return Ok(SweepReport::default());
            }
            Err(e) => {
                return Err(CsiError::internal(format!(
                    "read_dir {}: {e}",
                    root.display()
                )));
            }
        };

        let pods: HashMap<String, MountpointPod> = self
            .watcher
            .list()
            .into_iter()
            .map(|pod| (pod.uid.clone(), pod))
            .collect();

        let mut report = SweepReport::default();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CsiError::internal(format!("read_dir {}: {e}", root.display())))?
        {
            let Some(uid) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let volume_id = match pods.get(&uid) {
                Some(pod) if pod.is_live() => continue,
                Some(pod) => pod.volume_id().map(str::to_owned),
                None => None,
            };

            match self.unmount_and_cleanup(&uid, volume_id.as_deref()).await {
                Ok(()) => report.cleaned.push(uid),
                Err(e) => {
                    warn!(%uid, error = %e, "dangling mount cleanup failed");
                    report.failed.push((uid, e));
                }
            }
        }

        info!(
            cleaned = report.cleaned.len(),
            failed = report.failed.len(),
            "dangling mount sweep finished"
        );
        Ok(report)
    }

    /// Unmount the source of Mountpoint Pod `uid` and remove its credentials
    /// and directories.  Every step runs even if an earlier one fails; the
    /// first failure is returned.
    #[instrument(skip(self))]
    pub async fn unmount_and_cleanup(
        &self,
        uid: &str,
        volume_id: Option<&str>,
    ) -> Result<(), CsiError> {
        let _guard = self.locks.lock(uid).await;
        let source = self.paths.source_dir(uid);
        let comm_dir = self.paths.comm_dir(uid);
        let mut first_error: Option<CsiError> = None;

        let mounted = match self.mount.is_mount_point(&source).await {
            Ok(mounted) => mounted,
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                // Possibly a broken mount; try to unmount anyway.
                debug!(source = %source.display(), error = %e, "mountpoint check failed");
                true
            }
        };
        if mounted {
            match self.mount.unmount(&source).await {
                Ok(()) => info!(source = %source.display(), "Mountpoint Pod source unmounted"),
                Err(e) => {
                    first_error.get_or_insert(CsiError::UnmountFailed {
                        path: source.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Some(volume_id) = volume_id {
            let ctx = CleanupContext {
                pod_id: uid,
                volume_id,
                write_path: Some(&comm_dir),
            };
            if let Err(e) = self.credentials.cleanup(&ctx).await {
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = remove_if_present(&comm_dir, tokio::fs::remove_dir_all(&comm_dir).await) {
            first_error.get_or_insert(e);
        }
        // Non-recursive: a still-mounted source must never be traversed.
        if let Err(e) = remove_if_present(&source, tokio::fs::remove_dir(&source).await) {
            first_error.get_or_insert(e);
        }

        match first_error {
            None => {
                debug!("Mountpoint Pod resources cleaned up");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }
}

fn remove_if_present(path: &Path, result: io::Result<()>) -> Result<(), CsiError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(CsiError::internal(format!("remove {}: {e}", path.display()))),
    }
}

#[async_trait]
impl PodEventHandler for PodUnmounter {
    async fn on_update(&self, old: Option<&MountpointPod>, new: Option<&MountpointPod>) {
        self.handle_update(old, new).await;
    }
}
