use crate::{
    cache::{ControlPlaneStore, Lister, MemberStore},
    clusters::{Connect, SharedRegistry, Snapshot},
    core::{
        condition::{
            delete_status_condition, find_status_condition, set_status_condition, CACHE_SYNCED,
            GATEWAY_READY, PING_PASSED, READY, SPACES_READY,
        },
        ConnectionPhase, HasConditions, PhaseRollup, RetryPolicy,
    },
    k8s::{
        gateway_resource, Cluster, ClusterStatus, DynamicClient, DynamicObject, KubeClient,
        Namespace, ObjectClient, ObjectMeta, ResourceExt, Selector, TypedClient, CLUSTER_LABEL,
        OWNED_LABEL,
    },
    reconcile::{apply_resource, update_resource_status},
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde_json::json;
use std::{collections::BTreeMap, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

const SPACE_ACTIVE: &str = "Active";
const GATEWAY_PREFIX: &str = "fleet-gateway-";

/// Periodically writes each `Cluster`'s connection state and member-side
/// observations into its status.
pub struct Controller<C, K: Connect> {
    client: C,
    store: ControlPlaneStore,
    registry: SharedRegistry<K>,
    member: MemberSync,
    timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    result: String,
}

/// The object clients a connected member cluster's client bundle provides.
pub trait MemberClients {
    type Namespaces: ObjectClient<Namespace>;
    type Gateways: ObjectClient<DynamicObject>;

    fn namespaces(&self) -> Self::Namespaces;

    fn gateways(&self) -> Self::Gateways;
}

/// Ensures the platform's objects exist in a connected member cluster and
/// observes its spaces.
#[derive(Clone, Debug)]
pub(crate) struct MemberSync {
    pub(crate) namespace: String,
    pub(crate) retry: RetryPolicy,
}

// === impl Controller ===

impl<C, K> Controller<C, K>
where
    C: ObjectClient<Cluster>,
    K: Connect,
    K::Client: MemberClients,
{
    pub fn new(
        client: C,
        store: ControlPlaneStore,
        registry: SharedRegistry<K>,
        namespace: String,
        retry: RetryPolicy,
        timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            store,
            registry,
            member: MemberSync { namespace, retry },
            timeout,
            metrics,
        }
    }

    /// Reconciles every cluster on `interval` until shutdown is signaled.
    pub async fn run(self, interval: Duration, drain: drain::Watch) {
        let mut timer = time::interval(interval);
        timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                _ = timer.tick() => self.reconcile_all().await,
                handle = &mut shutdown => {
                    handle.release_after(self.store.stop()).await;
                    return;
                }
            }
        }
    }

    async fn reconcile_all(&self) {
        let clusters = match self.store.clusters().list(&Selector::everything()) {
            Ok(clusters) => clusters,
            Err(error) => {
                warn!(%error, "Cluster cache unavailable");
                return;
            }
        };

        let reconciles = clusters.iter().map(|cluster| async move {
            let name = cluster.name_any();
            let result = match time::timeout(self.timeout, self.reconcile(cluster)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("timed out after {:?}", self.timeout)),
            };
            match result {
                Ok(()) => self.metrics.inc(true),
                Err(error) => {
                    info!(cluster = %name, %error, "Failed to update status");
                    self.metrics.inc(false);
                }
            }
        });
        future::join_all(reconciles).await;
    }

    async fn reconcile(&self, cluster: &Cluster) -> Result<()> {
        let name = cluster.name_unchecked();
        let mut cluster = cluster.clone();
        if cluster.ensure_required_labels() {
            debug!(cluster = %name, "Setting required labels");
            cluster = apply_resource(&self.client, &mut cluster, self.member.retry).await?;
        }

        let domains = cluster.spec.wildcard_domains.clone();
        let handle = self.registry.get(&name);
        let status = cluster.status_mut();
        match &handle {
            Some(handle) => observe(status, &handle.snapshot()),
            None => status.phase = ConnectionPhase::Connecting,
        }

        if let Some(handle) = handle.filter(|h| h.phase().is_connected()) {
            let synced = async {
                let store = handle.store()?;
                let client = handle.client()?;
                let (namespaces, gateways) = (client.namespaces(), client.gateways());
                self.member
                    .sync(status, &name, &domains, &store, &namespaces, &gateways, now())
                    .await
            };
            if let Err(error) = synced.await {
                info!(cluster = %name, %error, "Failed to sync member cluster");
            }
        }

        update_resource_status(&self.client, &mut cluster, self.member.retry).await?;
        Ok(())
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of cluster status reconciliations by result",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    fn inc(&self, ok: bool) {
        self.reconciles.get_or_create(&ReconcileLabels::new(ok)).inc();
    }

    #[cfg(test)]
    fn reconciles(&self, ok: bool) -> u64 {
        self.reconciles.get_or_create(&ReconcileLabels::new(ok)).get()
    }
}

impl ReconcileLabels {
    fn new(ok: bool) -> Self {
        let result = if ok { "ok" } else { "error" }.to_string();
        Self { result }
    }
}

// === impl MemberClients ===

impl MemberClients for KubeClient {
    type Namespaces = TypedClient;
    type Gateways = DynamicClient;

    fn namespaces(&self) -> TypedClient {
        self.typed()
    }

    fn gateways(&self) -> DynamicClient {
        self.dynamic(gateway_resource())
    }
}

// === impl MemberSync ===

impl MemberSync {
    /// Ensures the builtin namespace and gateways, then rolls up spaces.
    ///
    /// Gateway failures are recorded in `GatewayReady`; a namespace failure
    /// stops the sync before anything else is written.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn sync<N, G>(
        &self,
        status: &mut ClusterStatus,
        cluster: &str,
        domains: &[String],
        store: &MemberStore,
        namespaces: &N,
        gateways: &G,
        now: DateTime<Utc>,
    ) -> Result<()>
    where
        N: ObjectClient<Namespace> + ?Sized,
        G: ObjectClient<DynamicObject> + ?Sized,
    {
        let mut builtin = builtin_namespace(&self.namespace, cluster);
        apply_resource(namespaces, &mut builtin, self.retry).await?;

        match store.gateway_classes() {
            Some(classes) if !domains.is_empty() => {
                let classes = classes.list(&Selector::everything())?;
                let result = if classes.is_empty() {
                    Err(anyhow!("no GatewayClass in member cluster"))
                } else {
                    self.apply_gateways(
                        gateways,
                        cluster,
                        classes.iter().map(|c| c.name_any()),
                        domains,
                    )
                    .await
                };
                status.set_status_condition_at(GATEWAY_READY, &result, now);
            }
            _ => {
                status.delete_status_condition(GATEWAY_READY);
            }
        }

        // Spaces are every namespace assigned to this cluster, whether or not
        // the platform created it.
        let selector = Selector::from_iter(Some((CLUSTER_LABEL, cluster)));
        let rollup = store
            .namespaces()
            .list(&selector)?
            .iter()
            .filter(|ns| ns.name_any() != self.namespace)
            .map(|ns| {
                let phase = ns
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".to_string());
                (ns.name_any(), phase)
            })
            .collect::<PhaseRollup>();
        set_status_condition(
            &mut status.conditions,
            rollup.condition(SPACES_READY, SPACE_ACTIVE, now),
        );
        status.space_count = rollup.len() as u32;
        status.spaces = rollup.into_phases();
        Ok(())
    }

    async fn apply_gateways<G>(
        &self,
        client: &G,
        cluster: &str,
        classes: impl Iterator<Item = String>,
        domains: &[String],
    ) -> Result<()>
    where
        G: ObjectClient<DynamicObject> + ?Sized,
    {
        let mut failures = Vec::new();
        for class in classes {
            let mut gateway = gateway(cluster, &class, domains, &self.namespace);
            if let Err(error) = apply_resource(client, &mut gateway, self.retry).await {
                failures.push(format!("{}: {error}", gateway.name_any()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }
}

/// Copies the handle's connection state into `status`.
pub(crate) fn observe(status: &mut ClusterStatus, snapshot: &Snapshot) {
    status.phase = snapshot.phase;
    status.server = snapshot.server.clone();
    status.version = snapshot.version.clone();
    for type_ in [PING_PASSED, CACHE_SYNCED, READY] {
        match find_status_condition(&snapshot.conditions, type_) {
            Some(condition) => {
                set_status_condition(&mut status.conditions, condition.clone());
            }
            None => {
                delete_status_condition(&mut status.conditions, type_);
            }
        }
    }
}

/// The gateway serving `domains` through one member `GatewayClass`.
pub(crate) fn gateway(cluster: &str, class: &str, domains: &[String], namespace: &str) -> DynamicObject {
    let listeners = domains
        .iter()
        .enumerate()
        .map(|(i, domain)| {
            json!({
                "name": format!("http-{i}"),
                "hostname": domain,
                "port": 80,
                "protocol": "HTTP",
                "allowedRoutes": { "namespaces": { "from": "All" } },
            })
        })
        .collect::<Vec<_>>();

    let mut gateway = DynamicObject::new(&format!("{GATEWAY_PREFIX}{class}"), &gateway_resource())
        .within(namespace)
        .data(json!({
            "spec": {
                "gatewayClassName": class,
                "listeners": listeners,
            },
        }));
    gateway.metadata.labels = Some(owned_labels(cluster));
    gateway
}

fn builtin_namespace(name: &str, cluster: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(owned_labels(cluster)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn owned_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNED_LABEL.to_string(), "true".to_string()),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
    ])
}

#[cfg(not(test))]
fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
fn now() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}
