use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::CsiNode;
use crate::credential::{CleanupContext, CredentialProvider, ProvideContext};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mount::args::{FOREGROUND, FOREGROUND_SHORT, READ_ONLY};
use crate::mount::{MountArgs, is_not_found};
use crate::mounter::Mounter;
use crate::targetpath::TargetPath;
use crate::types::*;

/// Name the plugin registers under.
pub const DRIVER_NAME: &str = "s3.csi.aws.com";

/// Node Request Server: translates publish and unpublish requests into
/// [`Mounter`] calls.
///
/// Serialization against the reconciler happens inside the [`Mounter`], which
/// takes the Mountpoint Pod lock; unpublish only touches the workload's own
/// target and tolerates anything already gone.
pub struct NodeServer {
    node_id: String,
    mounter: Arc<dyn Mounter>,
    credentials: Arc<dyn CredentialProvider>,
}

impl NodeServer {
    pub fn new(
        node_id: impl Into<String>,
        mounter: Arc<dyn Mounter>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            mounter,
            credentials,
        }
    }
}

/// Final mount arguments for a publish request.
///
/// A read-only access mode or request always adds `--read-only`; foreground
/// flags are dropped since the Mountpoint Pod supervises the client.
fn mount_args(capability: &VolumeCapability, read_only: bool) -> MountArgs {
    let mut args = MountArgs::parse(&capability.mount_flags);
    if read_only || capability.access_mode.is_read_only() {
        args.insert(READ_ONLY);
    }
    for flag in [FOREGROUND, FOREGROUND_SHORT] {
        if args.remove(flag) {
            info!(flag, "dropping foreground mount option");
        }
    }
    args
}

#[async_trait]
impl CsiNode for NodeServer {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID missing in request".into()));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path missing in request".into()));
        }
        let Some(capability) = &req.volume_capability else {
            return Err(CsiError::InvalidArgument(
                "volume capability missing in request".into(),
            ));
        };
        let bucket_name = req.bucket_name().ok_or_else(|| {
            CsiError::InvalidArgument(format!(
                "{VOLUME_CONTEXT_BUCKET_NAME} missing in volume context"
            ))
        })?;

        let args = mount_args(capability, req.read_only);
        // Non-kubelet targets are allowed, they just cannot carry pod-level
        // credentials.
        let pod_id = TargetPath::parse(&req.target_path).ok().map(|tp| tp.pod_id);

        let credentials = self
            .credentials
            .provide(&ProvideContext {
                pod_id: pod_id.as_deref(),
                volume_id: req.volume_id.as_str(),
                volume_context: &req.volume_context,
                mount_args: &args,
                write_path: None,
            })
            .await?;

        self.mounter
            .mount(bucket_name, &req.target_path, &credentials, &args)
            .await
            .inspect_err(|e| warn!(error = %e, "could not mount"))?;

        info!(bucket_name, %args, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID missing in request".into()));
        }
        if target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path missing in request".into()));
        }

        let mounted = match self.mounter.is_mount_point(target_path).await {
            Ok(mounted) => mounted,
            Err(e) if is_not_found(&e) => {
                debug!("target path does not exist, nothing to unmount");
                false
            }
            Err(e) => {
                return Err(CsiError::internal(format!(
                    "check mountpoint {target_path}: {e}"
                )));
            }
        };

        let unmounted = if mounted {
            self.mounter.unmount(target_path).await
        } else {
            debug!("target not mounted");
            Ok(())
        };

        // Tokens go away whatever happened to the mount.
        let cleaned = match TargetPath::parse(target_path) {
            Ok(tp) => {
                self.credentials
                    .cleanup(&CleanupContext {
                        pod_id: &tp.pod_id,
                        volume_id: &tp.volume_id,
                        write_path: None,
                    })
                    .await
            }
            Err(_) => {
                debug!("target path outside kubelet layout, skipping token cleanup");
                Ok(())
            }
        };

        unmounted.map_err(|e| CsiError::internal(format!("could not unmount {target_path}: {e}")))?;
        cleaned?;
        if mounted {
            info!("volume unpublished");
        }
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(Vec::new())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: 0,
            accessible_topology: Some(Topology {
                segments: HashMap::from([("node".to_owned(), self.node_id.clone())]),
            }),
        })
    }
}

#[async_trait]
impl CsiIdentity for NodeServer {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(Vec::new())
    }
}
