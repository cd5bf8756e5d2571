use crate::{
    connect::Connect,
    handle::{ClusterHandle, HandleParams},
    metrics::Metrics,
};
use ahash::AHashMap;
use futures::future;
use parking_lot::{Mutex, RwLock};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{debug, info, info_span, Instrument};

/// A change to the set of clusters the control plane manages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    Added { name: String, kubeconfig: String },
    Updated { name: String, kubeconfig: String },
    Deleted { name: String },
}

pub type SharedRegistry<C> = Arc<Registry<C>>;

// === impl ClusterEvent ===

impl ClusterEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Added { name, .. } | Self::Updated { name, .. } | Self::Deleted { name } => name,
        }
    }
}

/// Maps cluster names to their handles.
///
/// Writes to different names proceed independently; writes to the same name
/// are serialized, and a replaced or forgotten handle is fully stopped before
/// the write completes.
pub struct Registry<C: Connect> {
    connector: Arc<C>,
    params: HandleParams,
    metrics: Metrics,
    handles: RwLock<AHashMap<String, Arc<ClusterHandle<C>>>>,
    locks: Mutex<AHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

// === impl Registry ===

impl<C: Connect> Registry<C> {
    pub fn new(connector: C, params: HandleParams, metrics: Metrics) -> Self {
        Self {
            connector: Arc::new(connector),
            params,
            metrics,
            handles: RwLock::new(AHashMap::default()),
            locks: Mutex::new(AHashMap::default()),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Creates an unregistered, not yet connected handle.
    pub fn new_handle(&self, name: &str) -> Arc<ClusterHandle<C>> {
        Arc::new(ClusterHandle::new(
            name,
            self.connector.clone(),
            self.params,
            self.metrics.clone(),
        ))
    }

    /// Registers `handle` under `name`, stopping any handle it replaces.
    pub async fn set(&self, name: &str, handle: Arc<ClusterHandle<C>>) {
        let lock = self.lock_for(name);
        {
            let _guard = lock.lock().await;
            let previous = self.handles.read().get(name).cloned();
            if let Some(previous) = previous {
                if !Arc::ptr_eq(&previous, &handle) {
                    debug!(cluster = %name, "Replacing handle");
                    previous.stop().await;
                }
            }
            let len = {
                let mut handles = self.handles.write();
                handles.insert(name.to_string(), handle);
                handles.len()
            };
            self.metrics.set_handles(len);
        }
        self.release(name, lock);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterHandle<C>>> {
        self.handles.read().get(name).cloned()
    }

    /// Stops and removes the handle for `name`. Returns false if there was
    /// none.
    pub async fn forget(&self, name: &str) -> bool {
        let lock = self.lock_for(name);
        let found = {
            let _guard = lock.lock().await;
            let handle = self.handles.read().get(name).cloned();
            match handle {
                Some(handle) => {
                    handle.stop().await;
                    let len = {
                        let mut handles = self.handles.write();
                        handles.remove(name);
                        handles.len()
                    };
                    self.metrics.set_handles(len);
                    info!(cluster = %name, "Forgot cluster");
                    true
                }
                None => false,
            }
        };
        self.release(name, lock);
        found
    }

    /// Every registered handle, ordered by name.
    pub fn list(&self) -> Vec<Arc<ClusterHandle<C>>> {
        let mut handles = self.handles.read().values().cloned().collect::<Vec<_>>();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Applies one cluster event.
    ///
    /// Connection attempts run in the background; their task is returned so
    /// callers may wait on it.
    pub async fn handle_event(self: &Arc<Self>, event: ClusterEvent) -> Option<JoinHandle<()>> {
        match event {
            ClusterEvent::Added { name, kubeconfig } | ClusterEvent::Updated { name, kubeconfig } => {
                let handle = match self.get(&name) {
                    Some(handle) => handle,
                    None => {
                        let handle = self.new_handle(&name);
                        self.set(&name, handle.clone()).await;
                        handle
                    }
                };
                if !handle.request(&kubeconfig) {
                    debug!(cluster = %name, "Kubeconfig unchanged");
                    return None;
                }
                let span = info_span!("cluster", cluster = %name);
                Some(tokio::spawn(
                    async move { handle.reconcile().await }.instrument(span),
                ))
            }
            ClusterEvent::Deleted { name } => {
                self.forget(&name).await;
                None
            }
        }
    }

    /// Applies events until the sender is dropped.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Cluster events closed");
    }

    /// Pings every registered handle concurrently.
    pub async fn ping_all(&self) {
        let handles = self.list();
        let pings = handles.iter().map(|handle| async move {
            if let Err(error) = handle.ping().await {
                info!(cluster = %handle.name(), %error, "Cluster is unhealthy");
            }
        });
        future::join_all(pings).await;
    }

    /// Forgets every handle.
    pub async fn shutdown(&self) {
        let names = self
            .list()
            .iter()
            .map(|handle| handle.name().to_string())
            .collect::<Vec<_>>();
        future::join_all(names.iter().map(|name| self.forget(name))).await;
    }

    /// Pings every handle on `interval` until shutdown is signaled, then
    /// forgets every handle before releasing the shutdown.
    pub async fn run_health_checks(self: Arc<Self>, interval: Duration, drain: drain::Watch) {
        let mut timer = time::interval(interval);
        timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                _ = timer.tick() => self.ping_all().await,
                handle = &mut shutdown => {
                    info!(handles = self.len(), "Shutting down cluster handles");
                    handle.release_after(self.shutdown()).await;
                    return;
                }
            }
        }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(name.to_string()).or_default().clone()
    }

    fn release(&self, name: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock();
        if locks
            .get(name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(name);
        }
    }
}

impl<C: Connect> std::fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handles", &self.len())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}
