use crate::{
    informer::{Cached, Informers},
    member::spawn,
    StoreError,
};
use fleet_controller_k8s_api::{watcher, Cluster, ClusterClient};
use std::{sync::Arc, time::Duration};

/// Cached views of the control plane's own resources.
#[derive(Clone)]
pub struct ControlPlaneStore {
    inner: Arc<Inner>,
}

struct Inner {
    clusters: Cached<Cluster>,
    informers: Informers,
}

// === impl ControlPlaneStore ===

impl ControlPlaneStore {
    pub async fn start<C: ClusterClient>(client: &C, timeout: Duration) -> Result<Self, StoreError> {
        let mut informers = Informers::new("control-plane");
        let clusters = spawn::<Cluster, _>(&mut informers, client, watcher::Config::default());

        if let Err(error) = informers.wait_for_sync(timeout).await {
            informers.stop().await;
            return Err(error);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                clusters,
                informers,
            }),
        })
    }

    pub fn clusters(&self) -> &Cached<Cluster> {
        &self.inner.clusters
    }

    pub async fn stop(&self) {
        self.inner.informers.stop().await;
    }
}
