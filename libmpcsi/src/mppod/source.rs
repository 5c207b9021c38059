use futures::stream::BoxStream;
use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};

use super::MountpointPod;
use super::watcher::{PodEvent, PodSource};
use crate::error::CsiError;

/// [`PodSource`] backed by the Kubernetes API server.
///
/// The subscription is restricted server-side to pods scheduled to
/// `node_name` with a `spec.nodeName` field selector.
#[derive(Clone)]
pub struct KubePodSource {
    client: Client,
    namespace: String,
    node_name: String,
}

impl KubePodSource {
    pub fn new(client: Client, namespace: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            node_name: node_name.into(),
        }
    }
}

impl PodSource for KubePodSource {
    fn watch(&self) -> BoxStream<'static, Result<PodEvent, CsiError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let config =
            watcher::Config::default().fields(&format!("spec.nodeName={}", self.node_name));

        watcher(api, config)
            .default_backoff()
            .filter_map(|event| {
                future::ready(match event {
                    Ok(event) => convert(event).map(Ok),
                    Err(e) => Some(Err(CsiError::Watch(e.to_string()))),
                })
            })
            .boxed()
    }
}

fn convert(event: watcher::Event<Pod>) -> Option<PodEvent> {
    match event {
        watcher::Event::Init => Some(PodEvent::Init),
        watcher::Event::InitApply(pod) => MountpointPod::from_pod(&pod).map(PodEvent::InitApply),
        watcher::Event::InitDone => Some(PodEvent::InitDone),
        watcher::Event::Apply(pod) => MountpointPod::from_pod(&pod).map(PodEvent::Apply),
        watcher::Event::Delete(pod) => MountpointPod::from_pod(&pod).map(PodEvent::Delete),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod(uid: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: uid.map(str::to_owned),
                namespace: Some("mount-s3".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn converts_watch_events() {
        assert_eq!(convert(watcher::Event::Init), Some(PodEvent::Init));
        assert_eq!(convert(watcher::Event::InitDone), Some(PodEvent::InitDone));

        match convert(watcher::Event::Apply(pod(Some("uid1")))) {
            Some(PodEvent::Apply(mp)) => assert_eq!(mp.uid, "uid1"),
            other => panic!("unexpected {other:?}"),
        }
        match convert(watcher::Event::Delete(pod(Some("uid1")))) {
            Some(PodEvent::Delete(mp)) => assert_eq!(mp.namespace, "mount-s3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pods_without_uid_are_skipped() {
        assert_eq!(convert(watcher::Event::InitApply(pod(None))), None);
        assert_eq!(convert(watcher::Event::Apply(pod(None))), None);
    }
}
