use crate::StoreError;
use fleet_controller_k8s_api::{watcher, ResourceExt, Selector, WatchStream};
use futures::prelude::*;
use kube::{
    runtime::reflector::{self, store::Writer, ObjectRef},
    Resource,
};
use parking_lot::Mutex;
use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, info, info_span, Instrument};

/// Read access to one cached kind.
///
/// Returned objects are shared with the cache.
pub trait Lister<K> {
    fn list(&self, selector: &Selector) -> Result<Vec<Arc<K>>, StoreError>;

    fn get(&self, name: &str) -> Result<Option<Arc<K>>, StoreError>;

    fn get_namespaced(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, StoreError>;
}

/// A reflector store fed by one informer task.
///
/// Reads are refused until the informer has listed every object once, and
/// after the owning store has been stopped.
pub struct Cached<K>
where
    K: Resource + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    kind: Arc<str>,
    store: reflector::Store<K>,
    dyntype: K::DynamicType,
    synced: watch::Receiver<bool>,
    stopped: Arc<AtomicBool>,
}

/// The informer tasks backing one store, with their sync barrier.
pub(crate) struct Informers {
    cluster: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    synced: Vec<(Arc<str>, watch::Receiver<bool>)>,
    stopped: Arc<AtomicBool>,
}

// === impl Cached ===

impl<K> Cached<K>
where
    K: Resource + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    fn ready(&self) -> Result<(), StoreError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(StoreError::Stopped {
                kind: self.kind.to_string(),
            });
        }
        if !self.is_synced() {
            return Err(StoreError::NotSynced {
                kind: self.kind.to_string(),
            });
        }
        Ok(())
    }
}

impl<K> Clone for Cached<K>
where
    K: Resource + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            store: self.store.clone(),
            dyntype: self.dyntype.clone(),
            synced: self.synced.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<K> Lister<K> for Cached<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    fn list(&self, selector: &Selector) -> Result<Vec<Arc<K>>, StoreError> {
        self.ready()?;
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|obj| selector.matches(obj.labels()))
            .collect())
    }

    fn get(&self, name: &str) -> Result<Option<Arc<K>>, StoreError> {
        self.ready()?;
        Ok(self
            .store
            .get(&ObjectRef::new_with(name, self.dyntype.clone())))
    }

    fn get_namespaced(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, StoreError> {
        self.ready()?;
        Ok(self
            .store
            .get(&ObjectRef::new_with(name, self.dyntype.clone()).within(namespace)))
    }
}

// === impl Informers ===

impl Informers {
    pub(crate) fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            tasks: Mutex::new(Vec::new()),
            synced: Vec::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn spawn<K>(
        &mut self,
        kind: &str,
        dyntype: K::DynamicType,
        events: WatchStream<K>,
    ) -> Cached<K>
    where
        K: Resource + Clone + Send + Sync + 'static,
        K::DynamicType: Clone + Eq + Hash + Send + Sync,
    {
        let kind: Arc<str> = kind.into();
        let (tx, rx) = watch::channel(false);
        let writer = Writer::new(dyntype.clone());
        let store = writer.as_reader();

        let task = tokio::spawn(
            run(writer, events, tx)
                .instrument(info_span!("informer", cluster = %self.cluster, kind = %kind)),
        );
        self.tasks.get_mut().push(task);
        self.synced.push((kind.clone(), rx.clone()));

        Cached {
            kind,
            store,
            dyntype,
            synced: rx,
            stopped: self.stopped.clone(),
        }
    }

    /// Waits until every informer has synced, or fails once `timeout` elapses.
    pub(crate) async fn wait_for_sync(&self, timeout: Duration) -> Result<(), StoreError> {
        let waits = self.synced.iter().map(|(_, rx)| {
            let mut rx = rx.clone();
            async move {
                let _ = rx.wait_for(|synced| *synced).await;
            }
        });

        if time::timeout(timeout, future::join_all(waits)).await.is_err() {
            let kinds = self
                .synced
                .iter()
                .filter(|(_, rx)| !*rx.borrow())
                .map(|(kind, _)| kind.to_string())
                .collect();
            return Err(StoreError::SyncTimeout {
                cluster: self.cluster.clone(),
                kinds,
                timeout,
            });
        }

        // A waiter also completes when its informer exits without syncing.
        if let Some((kind, _)) = self.synced.iter().find(|(_, rx)| !*rx.borrow()) {
            return Err(StoreError::Terminated {
                cluster: self.cluster.clone(),
                kind: kind.to_string(),
            });
        }

        debug!(cluster = %self.cluster, kinds = self.synced.len(), "Caches synced");
        Ok(())
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops every informer and waits for its task to exit. Later calls do
    /// nothing.
    pub(crate) async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        debug!(cluster = %self.cluster, "Informers stopped");
    }
}

impl Drop for Informers {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn run<K>(mut writer: Writer<K>, mut events: WatchStream<K>, synced: watch::Sender<bool>)
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                writer.apply_watcher_event(&event);
                if let watcher::Event::InitDone = event {
                    if !synced.send_replace(true) {
                        debug!("Synced");
                    }
                }
            }
            Err(error) => {
                info!(%error, "Failed");
                time::sleep(Duration::from_secs(1)).await;
                info!("Restarting");
            }
        }
    }
    debug!("Terminated");
}
