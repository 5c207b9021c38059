use std::fmt;
use std::path::Path;

use crate::error::CsiError;

/// Workload pod and volume addressed by a kubelet CSI target path:
///
/// ```text
/// <kubelet>/pods/<podID>/volumes/kubernetes.io~csi/<volumeID>/mount
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPath {
    pub pod_id: String,
    pub volume_id: String,
}

impl TargetPath {
    pub fn parse(target: &str) -> Result<Self, CsiError> {
        let invalid = || CsiError::InvalidArgument(format!("unexpected target path {target:?}"));

        let parts: Vec<&str> = Path::new(target)
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        let [.., pods, pod_id, volumes, plugin, volume_id, mount] = parts.as_slice() else {
            return Err(invalid());
        };
        if *pods != "pods"
            || *volumes != "volumes"
            || *plugin != "kubernetes.io~csi"
            || *mount != "mount"
            || pod_id.is_empty()
            || volume_id.is_empty()
        {
            return Err(invalid());
        }
        Ok(Self {
            pod_id: (*pod_id).to_owned(),
            volume_id: (*volume_id).to_owned(),
        })
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pod {} volume {}", self.pod_id, self.volume_id)
    }
}
