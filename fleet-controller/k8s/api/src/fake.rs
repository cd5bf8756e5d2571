//! In-memory stand-ins for member clusters and API servers.

use crate::{
    client::{ClusterClient, WatchStream},
    object::ObjectClient,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::prelude::*;
use kube::{
    api::{ApiResource, DynamicObject},
    core::ErrorResponse,
    runtime::watcher,
    Resource,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// A member cluster with a fixed set of objects.
///
/// Watches replay the objects as an initial list and then stay open. Each
/// watch stream counts as live until it is dropped.
#[derive(Clone, Debug)]
pub struct FakeCluster {
    inner: Arc<ClusterState>,
}

#[derive(Debug)]
struct ClusterState {
    server: String,
    version: String,
    healthy: AtomicBool,
    hold_sync: AtomicBool,
    hang_discovery: AtomicBool,
    hang_version: AtomicBool,
    ping_delay: Mutex<Option<Duration>>,
    served: Mutex<Vec<ApiResource>>,
    objects: Mutex<Vec<Value>>,
    live_watches: AtomicUsize,
    watches_started: AtomicUsize,
}

struct WatchGuard(Arc<ClusterState>);

/// An API server holding objects of any kind, with optimistic concurrency on
/// resourceVersion.
#[derive(Clone, Debug, Default)]
pub struct FakeObjects {
    inner: Arc<Mutex<Objects>>,
}

/// Counts of the requests a `FakeObjects` has served.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Calls {
    pub gets: usize,
    pub creates: usize,
    pub replaces: usize,
    pub status_replaces: usize,
    pub patches: usize,
    pub deletes: usize,
    pub conflicts: usize,
}

#[derive(Debug, Default)]
struct Objects {
    items: BTreeMap<Key, Value>,
    version: u64,
    delay: Option<Duration>,
    injected_conflicts: usize,
    calls: Calls,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    kind: String,
    namespace: Option<String>,
    name: String,
}

pub fn api_error(code: u16, reason: &str, message: impl fmt::Display) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}

// === impl FakeCluster ===

impl FakeCluster {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClusterState {
                server: server.into(),
                version: "v1.33.0".to_string(),
                healthy: AtomicBool::new(true),
                hold_sync: AtomicBool::new(false),
                hang_discovery: AtomicBool::new(false),
                hang_version: AtomicBool::new(false),
                ping_delay: Mutex::new(None),
                served: Mutex::new(Vec::new()),
                objects: Mutex::new(Vec::new()),
                live_watches: AtomicUsize::new(0),
                watches_started: AtomicUsize::new(0),
            }),
        }
    }

    /// Adds an object. It must serialize with `apiVersion` and `kind`.
    pub fn with_object(self, obj: impl Serialize) -> Self {
        let value = serde_json::to_value(obj).expect("object must serialize");
        self.inner.objects.lock().push(value);
        self
    }

    /// Advertises an optional kind through discovery.
    pub fn serving(self, resource: ApiResource) -> Self {
        self.inner.served.lock().push(resource);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        *self.inner.ping_delay.lock() = delay;
    }

    /// When set, new watches never report their initial list as complete.
    pub fn hold_sync(&self, hold: bool) {
        self.inner.hold_sync.store(hold, Ordering::SeqCst);
    }

    /// When set, discovery requests never complete.
    pub fn hang_discovery(&self, hang: bool) {
        self.inner.hang_discovery.store(hang, Ordering::SeqCst);
    }

    /// When set, `/version` requests never complete.
    pub fn hang_version(&self, hang: bool) {
        self.inner.hang_version.store(hang, Ordering::SeqCst);
    }

    /// Watch streams that have not been dropped.
    pub fn live_watches(&self) -> usize {
        self.inner.live_watches.load(Ordering::SeqCst)
    }

    pub fn watches_started(&self) -> usize {
        self.inner.watches_started.load(Ordering::SeqCst)
    }

    fn objects_of<K: DeserializeOwned>(&self, api_version: &str, kind: &str) -> Vec<K> {
        self.inner
            .objects
            .lock()
            .iter()
            .filter(|v| v["apiVersion"] == api_version && v["kind"] == kind)
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    fn stream<K: Send + 'static>(&self, objects: Vec<K>) -> WatchStream<K> {
        let guard = WatchGuard::new(self.inner.clone());
        let mut events = vec![Ok(watcher::Event::Init)];
        events.extend(objects.into_iter().map(|o| Ok(watcher::Event::InitApply(o))));
        if !self.inner.hold_sync.load(Ordering::SeqCst) {
            events.push(Ok(watcher::Event::InitDone));
        }
        stream::iter(events)
            .chain(stream::pending())
            .map(move |ev| {
                guard.touch();
                ev
            })
            .boxed()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn server(&self) -> String {
        self.inner.server.clone()
    }

    async fn ping(&self) -> Result<()> {
        let delay = *self.inner.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.inner.healthy.load(Ordering::SeqCst) {
            bail!("dial tcp {}: connection refused", self.inner.server);
        }
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        if self.inner.hang_version.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        Ok(self.inner.version.clone())
    }

    async fn api_resource_exists(&self, resource: &ApiResource) -> bool {
        if self.inner.hang_discovery.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        self.inner
            .served
            .lock()
            .iter()
            .any(|r| r.api_version == resource.api_version && r.kind == resource.kind)
    }

    fn watch<K>(&self, _: watcher::Config) -> WatchStream<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
    {
        let objects = self.objects_of(&K::api_version(&()), &K::kind(&()));
        self.stream(objects)
    }

    fn watch_dynamic(
        &self,
        resource: &ApiResource,
        _: watcher::Config,
    ) -> WatchStream<DynamicObject> {
        let objects = self.objects_of(&resource.api_version, &resource.kind);
        self.stream(objects)
    }
}

// === impl WatchGuard ===

impl WatchGuard {
    fn new(state: Arc<ClusterState>) -> Self {
        state.live_watches.fetch_add(1, Ordering::SeqCst);
        state.watches_started.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }

    fn touch(&self) {}
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.live_watches.fetch_sub(1, Ordering::SeqCst);
    }
}

// === impl FakeObjects ===

impl FakeObjects {
    /// Stores an object as-is, assigning a resourceVersion.
    pub fn insert<K: Serialize>(&self, obj: &K) {
        let (key, mut value) = encode(obj).expect("object must serialize");
        let mut objects = self.inner.lock();
        let version = objects.next_version();
        set_resource_version(&mut value, &version);
        objects.items.insert(key, value);
    }

    /// Reads back a stored object.
    pub fn stored<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.stored_value(&K::kind(&()), namespace, name)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn stored_value(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        let key = Key {
            kind: kind.to_string(),
            namespace: namespace.map(Into::into),
            name: name.to_string(),
        };
        self.inner.lock().items.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `n` writes fail with a conflict, as if another writer
    /// had updated the object first.
    pub fn inject_conflicts(&self, n: usize) {
        self.inner.lock().injected_conflicts = n;
    }

    pub fn calls(&self) -> Calls {
        self.inner.lock().calls
    }

    /// Makes every request take `delay` before it is served.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.inner.lock().delay = delay;
    }

    async fn pause(&self) {
        let delay = self.inner.lock().delay;
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[async_trait]
impl<K> ObjectClient<K> for FakeObjects
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, obj: &K) -> kube::Result<Option<K>> {
        self.pause().await;
        let (key, _) = encode(obj)?;
        let value = {
            let mut objects = self.inner.lock();
            objects.calls.gets += 1;
            objects.items.get(&key).cloned()
        };
        value.map(decode).transpose()
    }

    async fn create(&self, obj: &K) -> kube::Result<K> {
        self.pause().await;
        let (key, mut value) = encode(obj)?;
        let mut objects = self.inner.lock();
        objects.calls.creates += 1;
        if resource_version(&value).is_some() {
            return Err(api_error(
                400,
                "BadRequest",
                "resourceVersion should not be set on objects to be created",
            ));
        }
        if objects.items.contains_key(&key) {
            objects.calls.conflicts += 1;
            return Err(api_error(
                409,
                "AlreadyExists",
                format_args!("{} {:?} already exists", key.kind, key.name),
            ));
        }
        let version = objects.next_version();
        set_resource_version(&mut value, &version);
        objects.items.insert(key, value.clone());
        decode(value)
    }

    async fn replace(&self, obj: &K) -> kube::Result<K> {
        self.pause().await;
        let (key, mut value) = encode(obj)?;
        let mut objects = self.inner.lock();
        objects.calls.replaces += 1;
        let current = objects.check_write(&key, resource_version(&value))?;
        match current.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        let version = objects.next_version();
        set_resource_version(&mut value, &version);
        objects.items.insert(key, value.clone());
        decode(value)
    }

    async fn replace_status(&self, obj: &K) -> kube::Result<K> {
        self.pause().await;
        let (key, value) = encode(obj)?;
        let mut objects = self.inner.lock();
        objects.calls.status_replaces += 1;
        let mut current = objects.check_write(&key, resource_version(&value))?;
        current["status"] = value.get("status").cloned().unwrap_or(Value::Null);
        let version = objects.next_version();
        set_resource_version(&mut current, &version);
        objects.items.insert(key, current.clone());
        decode(current)
    }

    async fn patch(&self, obj: &K, patch: &Value) -> kube::Result<K> {
        self.pause().await;
        let (key, _) = encode(obj)?;
        let mut objects = self.inner.lock();
        objects.calls.patches += 1;
        let mut current = objects.check_write(&key, resource_version(patch))?;
        json_patch::merge(&mut current, patch);
        let version = objects.next_version();
        set_resource_version(&mut current, &version);
        objects.items.insert(key, current.clone());
        decode(current)
    }

    async fn delete(&self, obj: &K) -> kube::Result<()> {
        self.pause().await;
        let (key, _) = encode(obj)?;
        let mut objects = self.inner.lock();
        objects.calls.deletes += 1;
        match objects.items.remove(&key) {
            Some(_) => Ok(()),
            None => Err(not_found(&key)),
        }
    }
}

impl Objects {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Returns the stored object if a write with the given precondition may
    /// proceed.
    fn check_write(&mut self, key: &Key, expected: Option<String>) -> kube::Result<Value> {
        let Some(mut current) = self.items.get(key).cloned() else {
            return Err(not_found(key));
        };

        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            self.calls.conflicts += 1;
            let version = self.next_version();
            set_resource_version(&mut current, &version);
            self.items.insert(key.clone(), current);
            return Err(conflict(key));
        }

        if let Some(expected) = expected {
            if resource_version(&current).as_ref() != Some(&expected) {
                self.calls.conflicts += 1;
                return Err(conflict(key));
            }
        }

        Ok(current)
    }
}

fn encode<K: Serialize>(obj: &K) -> kube::Result<(Key, Value)> {
    let value = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
    let key = Key {
        kind: value["kind"].as_str().unwrap_or_default().to_string(),
        namespace: value["metadata"]["namespace"].as_str().map(Into::into),
        name: value["metadata"]["name"].as_str().unwrap_or_default().to_string(),
    };
    Ok((key, value))
}

fn decode<K: DeserializeOwned>(value: Value) -> kube::Result<K> {
    serde_json::from_value(value).map_err(kube::Error::SerdeError)
}

fn resource_version(value: &Value) -> Option<String> {
    value["metadata"]["resourceVersion"]
        .as_str()
        .filter(|v| !v.is_empty())
        .map(Into::into)
}

fn set_resource_version(value: &mut Value, version: &str) {
    value["metadata"]["resourceVersion"] = Value::String(version.to_string());
}

fn conflict(key: &Key) -> kube::Error {
    api_error(
        409,
        "Conflict",
        format_args!(
            "Operation cannot be fulfilled on {} {:?}: the object has been modified",
            key.kind, key.name
        ),
    )
}

fn not_found(key: &Key) -> kube::Error {
    api_error(404, "NotFound", format_args!("{} {:?} not found", key.kind, key.name))
}
