//! Mountpoint Pods: the helper pods that mount buckets on behalf of the node
//! plugin.
//!
//! [`MountpointPod`] is an immutable snapshot of the few fields the node
//! plugin cares about.  New state arrives as a new snapshot from the
//! [`Watcher`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

pub mod source;
pub mod watcher;

pub use source::KubePodSource;
pub use watcher::{PodEvent, PodEventHandler, PodSource, Watcher};

/// Label carrying the volume ID a Mountpoint Pod serves.
pub const LABEL_VOLUME_ID: &str = "s3.csi.aws.com/volume-id";
/// Annotation set to `"true"` once the pod's mount must be torn down.
pub const ANNOTATION_NEEDS_UNMOUNT: &str = "s3.csi.aws.com/needs-unmount";

/// Point-in-time observation of a Mountpoint Pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountpointPod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// A deletion timestamp is set.
    #[serde(default)]
    pub terminating: bool,
}

impl MountpointPod {
    /// Build an observation from a Kubernetes pod.  Pods without a UID are
    /// not yet persisted and yield `None`.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let meta = &pod.metadata;
        let uid = meta.uid.clone().filter(|uid| !uid.is_empty())?;
        Some(Self {
            uid,
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.clone())
                .unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            terminating: meta.deletion_timestamp.is_some(),
        })
    }

    /// Volume ID from [`LABEL_VOLUME_ID`].
    pub fn volume_id(&self) -> Option<&str> {
        self.labels
            .get(LABEL_VOLUME_ID)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether [`ANNOTATION_NEEDS_UNMOUNT`] is `"true"`.
    pub fn needs_unmount(&self) -> bool {
        self.annotations
            .get(ANNOTATION_NEEDS_UNMOUNT)
            .is_some_and(|v| v == "true")
    }

    /// Neither terminating nor marked for unmount.
    pub fn is_live(&self) -> bool {
        !self.terminating && !self.needs_unmount()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod(uid: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("mp-1".into()),
                namespace: Some("mount-s3".into()),
                uid: uid.map(str::to_owned),
                labels: Some(BTreeMap::from([(LABEL_VOLUME_ID.into(), "vol1".into())])),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_NEEDS_UNMOUNT.into(),
                    "true".into(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn from_pod_extracts_fields() {
        let mp = MountpointPod::from_pod(&pod(Some("uid1"))).unwrap();
        assert_eq!(mp.uid, "uid1");
        assert_eq!(mp.node_name, "node-1");
        assert_eq!(mp.volume_id(), Some("vol1"));
        assert!(mp.needs_unmount());
        assert!(!mp.terminating);
        assert!(!mp.is_live());
    }

    #[test]
    fn from_pod_requires_uid() {
        assert!(MountpointPod::from_pod(&pod(None)).is_none());
    }

    #[test]
    fn terminating_pod() {
        let p: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "mp-1",
                "uid": "uid1",
                "deletionTimestamp": "2025-01-01T00:00:00Z"
            },
            "spec": { "nodeName": "node-1", "containers": [] }
        }))
        .unwrap();
        let mp = MountpointPod::from_pod(&p).unwrap();
        assert!(mp.terminating);
        assert!(!mp.needs_unmount());
        assert!(!mp.is_live());
    }

    #[test]
    fn needs_unmount_requires_true() {
        let mp = MountpointPod {
            annotations: BTreeMap::from([(ANNOTATION_NEEDS_UNMOUNT.into(), "false".into())]),
            ..Default::default()
        };
        assert!(!mp.needs_unmount());
        assert!(mp.is_live());
    }
}
