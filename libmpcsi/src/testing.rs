//! Test doubles shared by the unit tests.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use crate::error::CsiError;
use crate::mount::Mount;
use crate::mppod::{ANNOTATION_NEEDS_UNMOUNT, LABEL_VOLUME_ID, MountpointPod, PodEvent, PodSource};

pub const TEST_NAMESPACE: &str = "mount-s3";

/// Mountpoint Pod in [`TEST_NAMESPACE`].
pub fn mp_pod(uid: &str, node: &str, volume_id: Option<&str>, needs_unmount: bool) -> MountpointPod {
    let mut labels = BTreeMap::new();
    if let Some(volume_id) = volume_id {
        labels.insert(LABEL_VOLUME_ID.to_owned(), volume_id.to_owned());
    }
    let mut annotations = BTreeMap::new();
    if needs_unmount {
        annotations.insert(ANNOTATION_NEEDS_UNMOUNT.to_owned(), "true".to_owned());
    }
    MountpointPod {
        uid: uid.to_owned(),
        name: format!("mp-{uid}"),
        namespace: TEST_NAMESPACE.to_owned(),
        node_name: node.to_owned(),
        labels,
        annotations,
        terminating: false,
    }
}

/// Hand-fed [`PodSource`].  The stream stays open while the paired
/// [`FakePodEvents`] is alive.
pub struct FakePodSource {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<PodEvent, CsiError>>>>,
}

pub struct FakePodEvents {
    tx: mpsc::UnboundedSender<Result<PodEvent, CsiError>>,
}

impl FakePodEvents {
    pub fn send(&self, event: PodEvent) {
        let _ = self.tx.unbounded_send(Ok(event));
    }
}

impl FakePodSource {
    pub fn new() -> (Arc<Self>, FakePodEvents) {
        let (tx, rx) = mpsc::unbounded();
        (
            Arc::new(Self {
                rx: Mutex::new(Some(rx)),
            }),
            FakePodEvents { tx },
        )
    }

    /// Source whose initial list is `pods`.
    pub fn synced(pods: Vec<MountpointPod>) -> (Arc<Self>, FakePodEvents) {
        let (source, events) = Self::new();
        events.send(PodEvent::Init);
        for pod in pods {
            events.send(PodEvent::InitApply(pod));
        }
        events.send(PodEvent::InitDone);
        (source, events)
    }
}

impl PodSource for FakePodSource {
    fn watch(&self) -> BoxStream<'static, Result<PodEvent, CsiError>> {
        match self.rx.lock().take() {
            Some(rx) => rx.boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountAction {
    Bind {
        source: PathBuf,
        target: PathBuf,
        read_only: bool,
    },
    Unmount(PathBuf),
}

/// In-memory [`Mount`].  Paths count as mountpoints once bind-mounted or
/// registered with [`FakeMount::add_mount_point`].
#[derive(Default)]
pub struct FakeMount {
    actions: Mutex<Vec<MountAction>>,
    mount_points: Mutex<HashSet<PathBuf>>,
    unmount_error: Mutex<Option<io::ErrorKind>>,
}

impl FakeMount {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_mount_point(&self, path: impl Into<PathBuf>) {
        self.mount_points.lock().insert(path.into());
    }

    pub fn fail_unmounts(&self, kind: io::ErrorKind) {
        *self.unmount_error.lock() = Some(kind);
    }

    pub fn actions(&self) -> Vec<MountAction> {
        self.actions.lock().clone()
    }

    pub fn unmount_calls(&self) -> usize {
        self.actions
            .lock()
            .iter()
            .filter(|a| matches!(a, MountAction::Unmount(_)))
            .count()
    }
}

#[async_trait]
impl Mount for FakeMount {
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> io::Result<()> {
        self.actions.lock().push(MountAction::Bind {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            read_only,
        });
        self.mount_points.lock().insert(target.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> io::Result<()> {
        self.actions
            .lock()
            .push(MountAction::Unmount(target.to_path_buf()));
        if let Some(kind) = *self.unmount_error.lock() {
            return Err(io::Error::new(kind, "injected unmount failure"));
        }
        if self.mount_points.lock().remove(target) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::InvalidInput, "not mounted"))
        }
    }

    async fn is_mount_point(&self, target: &Path) -> io::Result<bool> {
        if self.mount_points.lock().contains(target) {
            return Ok(true);
        }
        tokio::fs::metadata(target).await.map(|_| false)
    }
}
