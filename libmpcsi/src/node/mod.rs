//! CSI Node service.
//!
//! The Node service runs on each worker node and makes a bucket available to
//! Pod containers.  The bucket itself is mounted by a Mountpoint Pod; this
//! service only bind-mounts that pod's source directory into the workload:
//!
//! 1. **Publish**: bind-mount the Mountpoint Pod source into the container.
//! 2. **Unpublish**: remove the bind-mount and the workload's credentials.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodeCapability, NodeInfo, NodePublishVolumeRequest, VolumeId};

mod server;

pub use server::{DRIVER_NAME, NodeServer};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Publish a volume: bind-mount the bucket into the container.
    ///
    /// This is idempotent: calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the container path.
    ///
    /// This is idempotent, a target that no longer exists is success.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Advertise the optional node RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
