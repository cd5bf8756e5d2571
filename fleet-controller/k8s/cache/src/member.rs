use crate::{
    informer::{Cached, Informers},
    StoreError,
};
use fleet_controller_k8s_api::{
    gateway_class_resource, owned_selector, space_selector, watcher, ClusterClient, Deployment,
    DynamicObject, IngressClass, Namespace, Service,
};
use futures::prelude::*;
use kube::Resource;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, warn};

/// Cached views of a member cluster's workload-facing objects.
///
/// A `MemberStore` exists only once every informer has synced. Clones share
/// the same informers.
#[derive(Clone)]
pub struct MemberStore {
    inner: Arc<Inner>,
}

struct Inner {
    namespaces: Cached<Namespace>,
    ingress_classes: Cached<IngressClass>,
    services: Cached<Service>,
    deployments: Cached<Deployment>,
    gateway_classes: Option<Cached<DynamicObject>>,
    informers: Informers,
}

/// Deadlines for starting a [`MemberStore`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StoreParams {
    /// Bound on each API discovery request.
    pub discovery_timeout: Duration,

    /// Bound on the initial sync of every informer.
    pub sync_timeout: Duration,
}

// === impl MemberStore ===

impl MemberStore {
    /// Starts the member cluster's informers and waits for them to sync.
    ///
    /// On failure every informer that was started is stopped before the
    /// error is returned.
    pub async fn start<C: ClusterClient>(
        cluster: &str,
        client: &C,
        params: StoreParams,
    ) -> Result<Self, StoreError> {
        Self::start_until(cluster, client, params, future::pending()).await
    }

    /// Like [`MemberStore::start`], but gives up with
    /// [`StoreError::Cancelled`] as soon as `cancel` completes.
    pub async fn start_until<C, F>(
        cluster: &str,
        client: &C,
        params: StoreParams,
        cancel: F,
    ) -> Result<Self, StoreError>
    where
        C: ClusterClient,
        F: Future<Output = ()>,
    {
        let owned = watcher::Config::default().labels(&owned_selector().to_string());
        let spaces = watcher::Config::default().labels(&space_selector().to_string());

        let mut informers = Informers::new(cluster);
        let namespaces = spawn::<Namespace, _>(&mut informers, client, spaces);
        let ingress_classes =
            spawn::<IngressClass, _>(&mut informers, client, watcher::Config::default());
        let services = spawn::<Service, _>(&mut informers, client, owned.clone());
        let deployments = spawn::<Deployment, _>(&mut informers, client, owned);

        let started = async {
            let gateway_classes =
                spawn_gateway_classes(&mut informers, cluster, client, params.discovery_timeout)
                    .await;
            informers.wait_for_sync(params.sync_timeout).await?;
            Ok::<_, StoreError>(gateway_classes)
        };
        let result = tokio::select! {
            result = started => result,
            () = cancel => Err(StoreError::Cancelled {
                cluster: cluster.to_string(),
            }),
        };
        let gateway_classes = match result {
            Ok(gateway_classes) => gateway_classes,
            Err(error) => {
                informers.stop().await;
                return Err(error);
            }
        };

        Ok(Self {
            inner: Arc::new(Inner {
                namespaces,
                ingress_classes,
                services,
                deployments,
                gateway_classes,
                informers,
            }),
        })
    }

    pub fn namespaces(&self) -> &Cached<Namespace> {
        &self.inner.namespaces
    }

    pub fn ingress_classes(&self) -> &Cached<IngressClass> {
        &self.inner.ingress_classes
    }

    pub fn services(&self) -> &Cached<Service> {
        &self.inner.services
    }

    pub fn deployments(&self) -> &Cached<Deployment> {
        &self.inner.deployments
    }

    /// Present only when the member cluster serves the Gateway API.
    pub fn gateway_classes(&self) -> Option<&Cached<DynamicObject>> {
        self.inner.gateway_classes.as_ref()
    }

    /// Stops every informer and waits for them to exit. Idempotent.
    pub async fn stop(&self) {
        self.inner.informers.stop().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.informers.is_stopped()
    }

    /// Whether both handles refer to the same informers.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Gateway API CRDs are optional in member clusters. A discovery request
/// that outlives `timeout` counts as not served.
async fn spawn_gateway_classes<C: ClusterClient>(
    informers: &mut Informers,
    cluster: &str,
    client: &C,
    timeout: Duration,
) -> Option<Cached<DynamicObject>> {
    let resource = gateway_class_resource();
    match time::timeout(timeout, client.api_resource_exists(&resource)).await {
        Ok(true) => {
            let events = client.watch_dynamic(&resource, watcher::Config::default());
            Some(informers.spawn(&resource.kind, resource.clone(), events))
        }
        Ok(false) => {
            debug!(%cluster, "Gateway API is not served");
            None
        }
        Err(_) => {
            warn!(%cluster, ?timeout, "Gateway API discovery timed out");
            None
        }
    }
}

pub(crate) fn spawn<K, C>(
    informers: &mut Informers,
    client: &C,
    params: watcher::Config,
) -> Cached<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
    C: ClusterClient,
{
    let kind = K::kind(&());
    informers.spawn(&kind, (), client.watch::<K>(params))
}
