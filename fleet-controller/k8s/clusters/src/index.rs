use crate::{connect::ConfigHash, registry::ClusterEvent};
use ahash::AHashMap;
use fleet_controller_k8s_api::{Cluster, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Turns control-plane `Cluster` watch events into registry events.
///
/// Updates that leave the kubeconfig unchanged are dropped here, so the
/// registry only hears about changes that matter to a connection.
#[derive(Debug)]
pub struct ClusterIndex {
    known: AHashMap<String, ConfigHash>,
    events: mpsc::UnboundedSender<ClusterEvent>,
}

pub type SharedIndex = Arc<RwLock<ClusterIndex>>;

// === impl ClusterIndex ===

impl ClusterIndex {
    pub fn shared(events: mpsc::UnboundedSender<ClusterEvent>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            known: AHashMap::default(),
            events,
        }))
    }

    fn send(&self, event: ClusterEvent) {
        if let Err(error) = self.events.send(event) {
            warn!(cluster = %error.0.name(), "Cluster event dropped; registry is not running");
        }
    }
}

impl kubert::index::IndexClusterResource<Cluster> for ClusterIndex {
    fn apply(&mut self, cluster: Cluster) {
        let name = cluster.name_unchecked();
        let kubeconfig = cluster.spec.kubeconfig;
        let hash = ConfigHash::of(&kubeconfig);

        match self.known.insert(name.clone(), hash) {
            None => {
                debug!(cluster = %name, %hash, "Added");
                self.send(ClusterEvent::Added { name, kubeconfig });
            }
            Some(prior) if prior == hash => {}
            Some(_) => {
                debug!(cluster = %name, %hash, "Kubeconfig changed");
                self.send(ClusterEvent::Updated { name, kubeconfig });
            }
        }
    }

    fn delete(&mut self, name: String) {
        if self.known.remove(&name).is_some() {
            debug!(cluster = %name, "Deleted");
            self.send(ClusterEvent::Deleted { name });
        }
    }
}
