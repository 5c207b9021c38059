//! Core CSI types: volume identity, capabilities, node requests and info.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and the node server.  They are all [`Serialize`]/[`Deserialize`] so they
//! can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Single-node read-only.
    ReadOnlyOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

impl AccessMode {
    /// Whether the mode only grants read access.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnlyOnce | Self::ReadOnlyMany)
    }
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// User-supplied mount flags, e.g. `"allow-delete"` or `"--uid 1000"`.
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteMany,
            mount_flags: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Volume context key carrying the bucket to mount.
pub const VOLUME_CONTEXT_BUCKET_NAME: &str = "bucketName";

/// Request to publish (bind-mount) a volume into a workload Pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Target path of the workload pod,
    /// e.g. `/var/lib/kubelet/pods/<pod-uid>/volumes/kubernetes.io~csi/<vol>/mount`.
    pub target_path: String,
    /// Requested capability.  Required.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context, carries `bucketName` and credential settings.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Whether the mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl NodePublishVolumeRequest {
    /// Bucket name from the volume context, if any.
    pub fn bucket_name(&self) -> Option<&str> {
        self.volume_context
            .get(VOLUME_CONTEXT_BUCKET_NAME)
            .map(String::as_str)
            .filter(|b| !b.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"s3.csi.aws.com"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
///
/// A node-only plugin has none, so the set is always empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {}

/// Optional node-service RPCs a node plugin may advertise.
///
/// Publish and unpublish are all this plugin serves; staging and volume
/// statistics are not offered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// Topology segments, e.g. `{"node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host, `0` for unlimited.
    pub max_volumes: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
