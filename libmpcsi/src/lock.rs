//! Reference-counted, per-pod locks.
//!
//! Both the node server (publish) and the [`PodUnmounter`] mutate the mount
//! state of a Mountpoint Pod.  They serialize on the pod UID through a single
//! [`MountpointPodLocks`] registry that is built once at start-up and shared
//! by reference.
//!
//! An entry lives in the registry exactly while its reference count is
//! positive.  The count is incremented *before* the caller waits on the pod
//! mutex, so an entry cannot be removed while somebody is still queued on it.
//! The registry map itself is guarded by a short-lived lock that is never
//! held across the pod's critical section.
//!
//! [`PodUnmounter`]: crate::mounter::PodUnmounter

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as PodMutex, OwnedMutexGuard};
use tracing::error;

struct LockEntry {
    mutex: Arc<PodMutex<()>>,
    ref_count: usize,
}

#[derive(Default)]
struct Registry {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl Registry {
    fn retain(&self, uid: &str) -> Arc<PodMutex<()>> {
        let mut locks = self.locks.lock();
        let entry = locks.entry(uid.to_owned()).or_insert_with(|| LockEntry {
            mutex: Arc::new(PodMutex::new(())),
            ref_count: 0,
        });
        entry.ref_count += 1;
        Arc::clone(&entry.mutex)
    }

    fn release(&self, uid: &str) {
        let mut locks = self.locks.lock();
        let Some(entry) = locks.get_mut(uid) else {
            // Only reachable through a caller bug.
            error!(uid, "attempted to release non-existent lock for Mountpoint Pod");
            return;
        };

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            locks.remove(uid);
        }
    }
}

/// Registry of per-Mountpoint-Pod locks keyed by pod UID.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct MountpointPodLocks {
    registry: Arc<Registry>,
}

impl MountpointPodLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the Mountpoint Pod identified by `uid`, waiting for any current
    /// holder to release it.
    ///
    /// The lock is released when the returned guard is dropped.  If this
    /// future is dropped while waiting, the reference taken on the entry is
    /// given back.
    pub async fn lock(&self, uid: &str) -> MountpointPodGuard {
        let mutex = self.registry.retain(uid);
        let release = Release {
            registry: Arc::clone(&self.registry),
            uid: uid.to_owned(),
        };
        let guard = mutex.lock_owned().await;
        MountpointPodGuard {
            _guard: guard,
            release,
        }
    }

    /// Number of UIDs that currently have an entry.
    pub fn len(&self) -> usize {
        self.registry.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `uid` currently has an entry (held or waited on).
    pub fn contains(&self, uid: &str) -> bool {
        self.registry.locks.lock().contains_key(uid)
    }
}

struct Release {
    registry: Arc<Registry>,
    uid: String,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.registry.release(&self.uid);
    }
}

/// Exclusive access to one Mountpoint Pod's mount state.
///
/// Fields drop in declaration order: the pod mutex is unlocked first, then the
/// reference count is decremented.
pub struct MountpointPodGuard {
    _guard: OwnedMutexGuard<()>,
    release: Release,
}

impl MountpointPodGuard {
    /// UID this guard holds the lock for.
    pub fn uid(&self) -> &str {
        &self.release.uid
    }
}
