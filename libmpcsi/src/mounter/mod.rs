//! Mount-state orchestration on top of the [`Mount`](crate::mount::Mount)
//! capability.
//!
//! * [`PodMounter`]: publish side: hands a mount request to the volume's
//!   Mountpoint Pod and bind-mounts the pod's source into the workload.
//! * [`PodUnmounter`]: reconciliation side: tears down the source mount of
//!   pods marked for unmount, and of pods that are gone.
//!
//! Both serialize on the Mountpoint Pod UID through the shared
//! [`MountpointPodLocks`](crate::lock::MountpointPodLocks).

use std::io;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::credential::MountCredentials;
use crate::error::CsiError;
use crate::mount::MountArgs;

mod pod;
mod unmounter;

pub use pod::{MOUNT_OPTIONS_FILE, MOUNTPOINT_POD_COMM_DIR, MountOptions, PodMounter};
pub use unmounter::{PodUnmounter, SweepReport};

/// Node-level mount operations used by the node server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Make `bucket_name` available at `target`.  Idempotent: an existing
    /// mount at `target` is success.
    async fn mount(
        &self,
        bucket_name: &str,
        target: &str,
        credentials: &MountCredentials,
        args: &MountArgs,
    ) -> Result<(), CsiError>;

    /// Unmount `target`.
    async fn unmount(&self, target: &str) -> Result<(), CsiError>;

    /// Whether `target` is a mountpoint; `ErrorKind::NotFound` when it does
    /// not exist.
    async fn is_mount_point(&self, target: &str) -> io::Result<bool>;
}
