//! Pod State Watcher.
//!
//! [`Watcher`] keeps an eventually-consistent cache of the Mountpoint Pods in
//! one namespace that are scheduled to the local node, fed by a
//! list-and-watch [`PodSource`].  A periodic resync redelivers every cached
//! pod as an update so that a missed event is eventually acted upon.
//!
//! Every registered [`PodEventHandler`] gets its own queue and delivery task:
//! a handler sees events in arrival order and never runs concurrently with
//! itself, while a slow handler does not hold back the others.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::MountpointPod;
use crate::error::CsiError;

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// One step of a list-and-watch subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    /// A (re)list started; the following [`PodEvent::InitApply`]s replace the
    /// cache once [`PodEvent::InitDone`] arrives.
    Init,
    /// A pod returned by the current list.
    InitApply(MountpointPod),
    /// The list is complete.
    InitDone,
    /// A pod was added or modified.
    Apply(MountpointPod),
    /// A pod was deleted.
    Delete(MountpointPod),
}

/// A long-lived list-and-watch subscription against the control plane.
pub trait PodSource: Send + Sync {
    /// Open the subscription.  The stream is expected to recover from
    /// transient errors on its own; errors are logged and skipped.
    fn watch(&self) -> BoxStream<'static, Result<PodEvent, CsiError>>;
}

/// Receives pod state changes from a [`Watcher`].
#[async_trait]
pub trait PodEventHandler: Send + Sync {
    /// `old` is `None` for additions, `new` is `None` for deletions.  A
    /// resync delivers the same state in both.
    async fn on_update(&self, old: Option<&MountpointPod>, new: Option<&MountpointPod>);
}

#[derive(Debug, Clone)]
struct PodUpdate {
    old: Option<MountpointPod>,
    new: Option<MountpointPod>,
}

struct Shared {
    namespace: String,
    node_name: String,
    pods: DashMap<String, MountpointPod>,
    /// Held while the cache is mutated so every handler queue sees changes in
    /// the same order as the cache.
    handlers: Mutex<Vec<mpsc::UnboundedSender<PodUpdate>>>,
    synced: watch::Sender<bool>,
    /// Bumped on every cache change.
    changes: watch::Sender<u64>,
    /// Cancelled once the run loop has exited.
    shutdown: CancellationToken,
    /// Caller's stop signal, set by `start`.
    stop: OnceLock<CancellationToken>,
}

impl Shared {
    fn owns(&self, pod: &MountpointPod) -> bool {
        pod.namespace == self.namespace && pod.node_name == self.node_name
    }

    fn apply(&self, event: PodEvent, relist: &mut Option<HashMap<String, MountpointPod>>) {
        match event {
            PodEvent::Init => *relist = Some(HashMap::new()),
            PodEvent::InitApply(pod) => match relist {
                Some(pods) => {
                    if self.owns(&pod) {
                        pods.insert(pod.uid.clone(), pod);
                    }
                }
                None => self.upsert(pod),
            },
            PodEvent::InitDone => {
                self.replace(relist.take().unwrap_or_default());
                if !self.synced.send_replace(true) {
                    info!(pods = self.pods.len(), "pod cache synced");
                }
            }
            PodEvent::Apply(pod) => self.upsert(pod),
            PodEvent::Delete(pod) => self.remove(pod),
        }
    }

    fn upsert(&self, pod: MountpointPod) {
        if !self.owns(&pod) {
            debug!(uid = %pod.uid, node = %pod.node_name, "ignoring pod outside this node");
            return;
        }
        let mut handlers = self.handlers.lock();
        let old = self.pods.insert(pod.uid.clone(), pod.clone());
        dispatch(&mut handlers, PodUpdate {
            old,
            new: Some(pod),
        });
        drop(handlers);
        self.bump();
    }

    fn remove(&self, pod: MountpointPod) {
        let mut handlers = self.handlers.lock();
        let old = match self.pods.remove(&pod.uid) {
            Some((_, cached)) => cached,
            None if self.owns(&pod) => pod,
            None => return,
        };
        dispatch(&mut handlers, PodUpdate {
            old: Some(old),
            new: None,
        });
        drop(handlers);
        self.bump();
    }

    fn replace(&self, mut listed: HashMap<String, MountpointPod>) {
        let mut handlers = self.handlers.lock();

        let stale: Vec<String> = self
            .pods
            .iter()
            .filter(|entry| !listed.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for uid in stale {
            if let Some((_, old)) = self.pods.remove(&uid) {
                debug!(%uid, "pod disappeared during relist");
                dispatch(&mut handlers, PodUpdate {
                    old: Some(old),
                    new: None,
                });
            }
        }

        for (uid, pod) in listed.drain() {
            let old = self.pods.insert(uid, pod.clone());
            dispatch(&mut handlers, PodUpdate {
                old,
                new: Some(pod),
            });
        }
        drop(handlers);
        self.bump();
    }

    fn resync(&self) {
        let mut handlers = self.handlers.lock();
        for entry in self.pods.iter() {
            let pod = entry.value().clone();
            dispatch(&mut handlers, PodUpdate {
                old: Some(pod.clone()),
                new: Some(pod),
            });
        }
        debug!(pods = self.pods.len(), "pod cache resynced");
    }

    /// True as soon as the caller asked to stop, even before the run loop
    /// has noticed.
    fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled() || self.stop.get().is_some_and(|stop| stop.is_cancelled())
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

fn dispatch(handlers: &mut Vec<mpsc::UnboundedSender<PodUpdate>>, update: PodUpdate) {
    handlers.retain(|tx| tx.send(update.clone()).is_ok());
}

/// Cached, node-local view of Mountpoint Pods.
pub struct Watcher {
    shared: Arc<Shared>,
    source: Arc<dyn PodSource>,
    resync_period: Duration,
    sync_timeout: Duration,
    started: AtomicBool,
}

impl Watcher {
    /// * `source`: list-and-watch subscription, already scoped server-side
    ///   where possible
    /// * `namespace`, `node_name`: only pods matching both are cached
    /// * `resync_period`: interval of full redelivery, zero disables it
    pub fn new(
        source: Arc<dyn PodSource>,
        namespace: impl Into<String>,
        node_name: impl Into<String>,
        resync_period: Duration,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                namespace: namespace.into(),
                node_name: node_name.into(),
                pods: DashMap::new(),
                handlers: Mutex::new(Vec::new()),
                synced,
                changes,
                shutdown: CancellationToken::new(),
                stop: OnceLock::new(),
            }),
            source,
            resync_period,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            started: AtomicBool::new(false),
        }
    }

    /// Bound on how long [`Self::start`] waits for the initial list.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Open the subscription and wait until the cache holds the initial list.
    ///
    /// Cancelling `stop` ends the subscription, the resync loop and every
    /// handler's delivery; no handler is invoked afterwards.
    pub async fn start(&self, stop: CancellationToken) -> Result<(), CsiError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CsiError::Watch("watcher already started".into()));
        }

        let _ = self.shared.stop.set(stop.clone());
        let events = self.source.watch();
        tokio::spawn(run(
            Arc::clone(&self.shared),
            events,
            self.resync_period,
            stop,
        ));

        let mut synced = self.shared.synced.subscribe();
        let shutdown = self.shared.shutdown.clone();
        let wait = async move {
            tokio::select! {
                res = synced.wait_for(|synced| *synced) => res.is_ok(),
                _ = shutdown.cancelled() => false,
            }
        };
        match tokio::time::timeout(self.sync_timeout, wait).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(CsiError::Watch(
                "watcher stopped before the pod cache synced".into(),
            )),
            Err(_) => Err(CsiError::Watch(format!(
                "pod cache did not sync within {:?}",
                self.sync_timeout
            ))),
        }
    }

    /// Register `handler` for every future add, update and delete.
    ///
    /// Pods already cached are replayed to it as additions first.  Must be
    /// called from within a Tokio runtime.
    pub fn add_handler(&self, handler: Arc<dyn PodEventHandler>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PodUpdate>();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => break,
                    update = rx.recv() => match update {
                        Some(update) => update,
                        None => break,
                    },
                };
                // Updates still queued when stop fires are dropped.
                if shared.is_stopped() {
                    break;
                }
                handler
                    .on_update(update.old.as_ref(), update.new.as_ref())
                    .await;
            }
        });

        let mut handlers = self.shared.handlers.lock();
        for entry in self.shared.pods.iter() {
            let _ = tx.send(PodUpdate {
                old: None,
                new: Some(entry.value().clone()),
            });
        }
        handlers.push(tx);
    }

    /// Snapshot of every cached pod.
    pub fn list(&self) -> Vec<MountpointPod> {
        self.shared
            .pods
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Cached pod with `uid`.
    pub fn get(&self, uid: &str) -> Option<MountpointPod> {
        self.shared.pods.get(uid).map(|pod| pod.value().clone())
    }

    /// Wait up to `timeout` for a cached pod matching `predicate`.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<MountpointPod>
    where
        F: FnMut(&MountpointPod) -> bool,
    {
        let mut changes = self.shared.changes.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let found = self
                .shared
                .pods
                .iter()
                .find(|entry| predicate(entry.value()))
                .map(|entry| entry.value().clone());
            if found.is_some() {
                return found;
            }

            tokio::select! {
                res = changes.changed() => {
                    if res.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = self.shared.shutdown.cancelled() => return None,
            }
        }
    }

    pub fn is_synced(&self) -> bool {
        *self.shared.synced.borrow()
    }

    pub fn node_name(&self) -> &str {
        &self.shared.node_name
    }
}

async fn run(
    shared: Arc<Shared>,
    mut events: BoxStream<'static, Result<PodEvent, CsiError>>,
    resync_period: Duration,
    stop: CancellationToken,
) {
    let mut resync = (!resync_period.is_zero()).then(|| {
        let mut interval = tokio::time::interval_at(Instant::now() + resync_period, resync_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut relist = None;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(event)) => shared.apply(event, &mut relist),
                Some(Err(e)) => warn!(error = %e, "pod watch error"),
                None => {
                    warn!("pod watch stream ended");
                    break;
                }
            },
            _ = tick(&mut resync) => shared.resync(),
        }
    }

    shared.shutdown.cancel();
    info!(node = %shared.node_name, "pod watcher stopped");
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePodSource, TEST_NAMESPACE, mp_pod};

    type Delivered = (Option<MountpointPod>, Option<MountpointPod>);

    struct Recorder {
        tx: mpsc::UnboundedSender<Delivered>,
    }

    #[async_trait]
    impl PodEventHandler for Recorder {
        async fn on_update(&self, old: Option<&MountpointPod>, new: Option<&MountpointPod>) {
            let _ = self.tx.send((old.cloned(), new.cloned()));
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Delivered>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Delivered>) -> Delivered {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handler invocation")
            .expect("handler channel open")
    }

    fn watcher(source: Arc<FakePodSource>, resync: Duration) -> Watcher {
        Watcher::new(source, TEST_NAMESPACE, "node-1", resync)
            .with_sync_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn start_waits_for_initial_list() {
        let (source, _events) = FakePodSource::synced(vec![
            mp_pod("uid1", "node-1", Some("vol1"), false),
            mp_pod("uid2", "node-2", Some("vol2"), false),
        ]);
        let watcher = watcher(source, Duration::ZERO);
        let stop = CancellationToken::new();

        watcher.start(stop.clone()).await.unwrap();

        assert!(watcher.is_synced());
        let pods = watcher.list();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].uid, "uid1");
        assert!(watcher.get("uid2").is_none());
        stop.cancel();
    }

    #[tokio::test]
    async fn start_times_out_without_initial_list() {
        let (source, _events) = FakePodSource::new();
        let watcher = Watcher::new(source, TEST_NAMESPACE, "node-1", Duration::ZERO)
            .with_sync_timeout(Duration::from_millis(50));

        let err = watcher.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CsiError::Watch(_)));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (source, _events) = FakePodSource::synced(vec![]);
        let watcher = watcher(source, Duration::ZERO);
        let stop = CancellationToken::new();
        watcher.start(stop.clone()).await.unwrap();
        assert!(watcher.start(stop.clone()).await.is_err());
        stop.cancel();
    }

    #[tokio::test]
    async fn handler_sees_add_update_delete_in_order() {
        let (source, events) = FakePodSource::synced(vec![]);
        let watcher = watcher(source, Duration::ZERO);
        let (handler, mut rx) = recorder();
        watcher.add_handler(handler);
        let stop = CancellationToken::new();
        watcher.start(stop.clone()).await.unwrap();

        let pod = mp_pod("uid1", "node-1", Some("vol1"), false);
        let marked = mp_pod("uid1", "node-1", Some("vol1"), true);
        events.send(PodEvent::Apply(pod.clone()));
        events.send(PodEvent::Apply(marked.clone()));
        events.send(PodEvent::Delete(marked.clone()));

        assert_eq!(next(&mut rx).await, (None, Some(pod.clone())));
        assert_eq!(next(&mut rx).await, (Some(pod), Some(marked.clone())));
        assert_eq!(next(&mut rx).await, (Some(marked), None));
        assert!(watcher.list().is_empty());
        stop.cancel();
    }

    #[tokio::test]
    async fn relist_drops_vanished_pods() {
        let (source, events) =
            FakePodSource::synced(vec![mp_pod("uid1", "node-1", Some("vol1"), false)]);
        let watcher = watcher(source, Duration::ZERO);
        let stop = CancellationToken::new();
        watcher.start(stop.clone()).await.unwrap();
        let (handler, mut rx) = recorder();
        watcher.add_handler(handler);
        // Replay of the cached pod.
        assert_eq!(next(&mut rx).await.0, None);

        let survivor = mp_pod("uid2", "node-1", Some("vol2"), false);
        events.send(PodEvent::Init);
        events.send(PodEvent::InitApply(survivor.clone()));
        events.send(PodEvent::InitDone);

        let (old, new) = next(&mut rx).await;
        assert_eq!(old.map(|p| p.uid), Some("uid1".to_owned()));
        assert!(new.is_none());
        assert_eq!(next(&mut rx).await, (None, Some(survivor)));
        assert_eq!(watcher.list().len(), 1);
        stop.cancel();
    }

    #[tokio::test]
    async fn resync_redelivers_cached_state() {
        let pod = mp_pod("uid1", "node-1", Some("vol1"), false);
        let (source, _events) = FakePodSource::synced(vec![pod.clone()]);
        let watcher = watcher(source, Duration::from_millis(20));
        let stop = CancellationToken::new();
        watcher.start(stop.clone()).await.unwrap();
        let (handler, mut rx) = recorder();
        watcher.add_handler(handler);

        assert_eq!(next(&mut rx).await, (None, Some(pod.clone())));
        assert_eq!(next(&mut rx).await, (Some(pod.clone()), Some(pod)));
        stop.cancel();
    }

    #[tokio::test]
    async fn no_delivery_after_stop() {
        let (source, events) = FakePodSource::synced(vec![]);
        let watcher = watcher(source, Duration::ZERO);
        let (handler, mut rx) = recorder();
        watcher.add_handler(handler);
        let stop = CancellationToken::new();
        watcher.start(stop.clone()).await.unwrap();

        stop.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        events.send(PodEvent::Apply(mp_pod("uid1", "node-1", None, true)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rx.try_recv().is_err());
    }

    struct Gated {
        tx: mpsc::UnboundedSender<Delivered>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl PodEventHandler for Gated {
        async fn on_update(&self, old: Option<&MountpointPod>, new: Option<&MountpointPod>) {
            let _ = self.tx.send((old.cloned(), new.cloned()));
            let _ = self.gate.acquire().await;
        }
    }

    #[tokio::test]
    async fn queued_updates_dropped_on_stop() {
        let (source, events) = FakePodSource::synced(vec![]);
        let watcher = watcher(source, Duration::ZERO);
        let stop = CancellationToken::new();
        watcher.start(stop.clone()).await.unwrap();

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.add_handler(Arc::new(Gated {
            tx,
            gate: Arc::clone(&gate),
        }));

        events.send(PodEvent::Apply(mp_pod("uid1", "node-1", None, false)));
        assert_eq!(next(&mut rx).await.1.unwrap().uid, "uid1");

        // The handler is busy with uid1 while two more updates queue up.
        events.send(PodEvent::Apply(mp_pod("uid2", "node-1", None, false)));
        events.send(PodEvent::Apply(mp_pod("uid3", "node-1", None, false)));
        tokio::time::timeout(Duration::from_secs(5), async {
            while watcher.get("uid3").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop.cancel();
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wait_for_wakes_on_new_pod() {
        let (source, events) = FakePodSource::synced(vec![]);
        let watcher = Arc::new(watcher(source, Duration::ZERO));
        let stop = CancellationToken::new();
        watcher.start(stop.clone()).await.unwrap();

        let waiter = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move {
                watcher
                    .wait_for(Duration::from_secs(5), |pod| pod.volume_id() == Some("vol1"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        events.send(PodEvent::Apply(mp_pod("uid1", "node-1", Some("vol1"), false)));

        let found = waiter.await.unwrap().expect("pod found");
        assert_eq!(found.uid, "uid1");
        stop.cancel();
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let (source, _events) = FakePodSource::synced(vec![]);
        let watcher = watcher(source, Duration::ZERO);
        let stop = CancellationToken::new();
        watcher.start(stop.clone()).await.unwrap();

        let found = watcher
            .wait_for(Duration::from_millis(20), |_| true)
            .await;
        assert!(found.is_none());
        stop.cancel();
    }
}
