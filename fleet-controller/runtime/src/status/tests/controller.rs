use super::*;
use crate::{
    clusters::{ClusterEvent, ConnectError, HandleParams, Metrics, Registry},
    k8s::{fake, watcher, ApiResource, ClusterClient, ClusterSpec, Resource, WatchStream},
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, fmt, sync::Arc};

/// A member cluster whose object writes land in memory.
#[derive(Clone)]
struct Member {
    cluster: FakeCluster,
    objects: FakeObjects,
}

/// Resolves kubeconfigs to members.
#[derive(Default)]
struct Members(HashMap<String, Member>);

#[async_trait]
impl ClusterClient for Member {
    fn server(&self) -> String {
        self.cluster.server()
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.cluster.ping().await
    }

    async fn server_version(&self) -> anyhow::Result<String> {
        self.cluster.server_version().await
    }

    async fn api_resource_exists(&self, resource: &ApiResource) -> bool {
        self.cluster.api_resource_exists(resource).await
    }

    fn watch<K>(&self, params: watcher::Config) -> WatchStream<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
    {
        self.cluster.watch(params)
    }

    fn watch_dynamic(
        &self,
        resource: &ApiResource,
        params: watcher::Config,
    ) -> WatchStream<DynamicObject> {
        self.cluster.watch_dynamic(resource, params)
    }
}

impl MemberClients for Member {
    type Namespaces = FakeObjects;
    type Gateways = FakeObjects;

    fn namespaces(&self) -> FakeObjects {
        self.objects.clone()
    }

    fn gateways(&self) -> FakeObjects {
        self.objects.clone()
    }
}

#[async_trait]
impl Connect for Members {
    type Client = Member;

    async fn connect(&self, kubeconfig: &str) -> Result<Member, ConnectError> {
        self.0.get(kubeconfig).cloned().ok_or_else(|| {
            ConnectError::Client(fake::api_error(401, "Unauthorized", "invalid bearer token"))
        })
    }
}

fn cluster(name: &str, kubeconfig: &str) -> Cluster {
    Cluster::new(
        name,
        ClusterSpec {
            description: None,
            kubeconfig: kubeconfig.to_string(),
            wildcard_domains: vec![],
        },
    )
}

fn registry(members: Members) -> SharedRegistry<Members> {
    Arc::new(Registry::new(
        members,
        HandleParams::default(),
        Metrics::default(),
    ))
}

/// Builds a controller whose control plane stores `clusters`.
async fn controller(
    registry: SharedRegistry<Members>,
    clusters: &[Cluster],
    timeout: Duration,
) -> (Controller<FakeObjects, Members>, FakeObjects) {
    let control_plane = clusters.iter().fold(
        FakeCluster::new("https://control-plane.example.com"),
        |control_plane, cluster| control_plane.with_object(cluster),
    );
    let store = match ControlPlaneStore::start(&control_plane, TIMEOUT).await {
        Ok(store) => store,
        Err(error) => panic!("store must sync: {error}"),
    };

    let objects = FakeObjects::default();
    for cluster in clusters {
        objects.insert(cluster);
    }

    let controller = Controller::new(
        objects.clone(),
        store,
        registry,
        NS.to_string(),
        RetryPolicy::immediate(3),
        timeout,
        ControllerMetrics::default(),
    );
    (controller, objects)
}

#[tokio::test(start_paused = true)]
async fn reconcile_all_writes_each_cluster_status() {
    let a = Member {
        cluster: member(),
        objects: FakeObjects::default(),
    };
    let registry = registry(Members(HashMap::from([("kc-a".to_string(), a.clone())])));
    registry
        .handle_event(ClusterEvent::Added {
            name: "a".to_string(),
            kubeconfig: "kc-a".to_string(),
        })
        .await
        .expect("a new cluster must connect")
        .await
        .unwrap();

    let clusters = [cluster("a", "kc-a"), cluster("b", "kc-b")];
    let (controller, objects) = controller(registry, &clusters, TIMEOUT).await;
    controller.reconcile_all().await;

    assert_eq!(controller.metrics.reconciles(true), 2);
    assert_eq!(controller.metrics.reconciles(false), 0);

    let connected = objects
        .stored::<Cluster>(None, "a")
        .expect("cluster a must be stored");
    assert_eq!(connected.labels(), &owned_labels("a"));
    let status = connected.status.expect("status must be written");
    assert_eq!(status.phase, ConnectionPhase::Connected);
    assert_eq!(status.server.as_deref(), Some("https://a.example.com"));
    assert_eq!(status.version.as_deref(), Some("v1.33.0"));
    for type_ in [PING_PASSED, CACHE_SYNCED, READY] {
        assert!(condition(&status, type_).unwrap().is_true(), "{type_}");
    }
    assert_eq!(
        status.spaces,
        btreemap! {
            "team-a".to_string() => "Active".to_string(),
            "team-b".to_string() => "Terminating".to_string(),
        }
    );
    let builtin = a
        .objects
        .stored::<Namespace>(None, NS)
        .expect("builtin namespace must be created in the member");
    assert_eq!(builtin.labels(), &owned_labels("a"));

    // Without a handle the cluster is reported as still connecting.
    let pending = objects
        .stored::<Cluster>(None, "b")
        .expect("cluster b must be stored");
    assert_eq!(pending.labels(), &owned_labels("b"));
    let status = pending.status.expect("status must be written");
    assert_eq!(status.phase, ConnectionPhase::Connecting);
    assert!(status.conditions.is_empty());
    assert!(status.spaces.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_writes_time_out_per_cluster() {
    let clusters = [cluster("a", "kc-a"), cluster("b", "kc-b")];
    let (controller, objects) =
        controller(registry(Members::default()), &clusters, Duration::from_secs(1)).await;
    objects.set_delay(Some(Duration::from_secs(10)));

    let start = time::Instant::now();
    controller.reconcile_all().await;

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(controller.metrics.reconciles(false), 2);
    assert_eq!(controller.metrics.reconciles(true), 0);
    for name in ["a", "b"] {
        let cluster = objects.stored::<Cluster>(None, name).unwrap();
        assert!(cluster.status.is_none(), "{name}");
    }
}
