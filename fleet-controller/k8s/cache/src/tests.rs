use crate::{
    informer::Informers, member, ControlPlaneStore, Lister, MemberStore, StoreError, StoreParams,
};
use fleet_controller_k8s_api::{
    fake::FakeCluster, gateway_class_resource, watcher, Cluster, ClusterSpec, DynamicObject,
    Namespace, ObjectMeta, Selector, Service,
};
use maplit::btreemap;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time;

const TIMEOUT: Duration = Duration::from_secs(30);

const PARAMS: StoreParams = StoreParams {
    discovery_timeout: Duration::from_secs(5),
    sync_timeout: TIMEOUT,
};

#[tokio::test(start_paused = true)]
async fn member_store_serves_synced_objects() {
    let cluster = FakeCluster::new("https://a.example.com")
        .with_object(namespace(
            "team-a",
            btreemap! { "fleet.io/owned" => "true", "fleet.io/cluster" => "a" },
        ))
        .with_object(namespace(
            "team-b",
            btreemap! { "fleet.io/owned" => "true", "fleet.io/cluster" => "b" },
        ))
        .with_object(service("team-a", "web"));

    let store = match MemberStore::start("a", &cluster, PARAMS).await {
        Ok(store) => store,
        Err(error) => panic!("store must sync: {error}"),
    };

    let selected = store
        .namespaces()
        .list(&Selector::from_iter(Some(("fleet.io/cluster", "a"))))
        .unwrap();
    assert_eq!(names(&selected), vec!["team-a"]);
    assert_eq!(
        store.namespaces().list(&Selector::everything()).unwrap().len(),
        2
    );
    assert!(store.namespaces().get("team-b").unwrap().is_some());
    assert!(store
        .services()
        .get_namespaced("team-a", "web")
        .unwrap()
        .is_some());
    assert!(store
        .services()
        .get_namespaced("team-b", "web")
        .unwrap()
        .is_none());
    assert!(store.deployments().list(&Selector::everything()).unwrap().is_empty());
    assert!(store.gateway_classes().is_none());
    assert_eq!(cluster.live_watches(), 4);
}

#[tokio::test(start_paused = true)]
async fn gateway_classes_are_cached_when_served() {
    let resource = gateway_class_resource();
    let cluster = FakeCluster::new("https://a.example.com")
        .serving(resource.clone())
        .with_object(DynamicObject::new("envoy", &resource).data(serde_json::json!({
            "spec": { "controllerName": "gateway.envoyproxy.io/gatewayclass-controller" },
        })));

    let store = match MemberStore::start("a", &cluster, PARAMS).await {
        Ok(store) => store,
        Err(error) => panic!("store must sync: {error}"),
    };

    let classes = store.gateway_classes().expect("gateway classes must be cached");
    assert_eq!(classes.kind(), "GatewayClass");
    assert!(classes.get("envoy").unwrap().is_some());
    assert_eq!(cluster.live_watches(), 5);
}

#[tokio::test(start_paused = true)]
async fn sync_timeout_stops_started_informers() {
    let cluster = FakeCluster::new("https://a.example.com");
    cluster.hold_sync(true);

    let error = match MemberStore::start("a", &cluster, PARAMS).await {
        Ok(_) => panic!("sync must time out"),
        Err(error) => error,
    };
    match error {
        StoreError::SyncTimeout {
            cluster: name,
            kinds,
            timeout,
        } => {
            assert_eq!(name, "a");
            assert_eq!(
                kinds,
                vec!["Namespace", "IngressClass", "Service", "Deployment"]
            );
            assert_eq!(timeout, TIMEOUT);
        }
        error => panic!("unexpected error: {error}"),
    }
    assert_eq!(cluster.watches_started(), 4);
    assert_eq!(cluster.live_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_discovery_counts_as_not_served() {
    let cluster = FakeCluster::new("https://a.example.com").serving(gateway_class_resource());
    cluster.hang_discovery(true);

    let start = time::Instant::now();
    let store = match MemberStore::start("a", &cluster, PARAMS).await {
        Ok(store) => store,
        Err(error) => panic!("store must sync: {error}"),
    };

    assert!(start.elapsed() >= PARAMS.discovery_timeout);
    assert!(start.elapsed() < TIMEOUT);
    assert!(store.gateway_classes().is_none());
    assert_eq!(cluster.live_watches(), 4);
}

#[tokio::test(start_paused = true)]
async fn cancelled_start_stops_started_informers() {
    let cluster = FakeCluster::new("https://a.example.com");
    cluster.hold_sync(true);

    let start = time::Instant::now();
    let cancel = time::sleep(Duration::from_secs(1));
    let error = match MemberStore::start_until("a", &cluster, PARAMS, cancel).await {
        Ok(_) => panic!("start must be cancelled"),
        Err(error) => error,
    };

    assert_eq!(
        error,
        StoreError::Cancelled {
            cluster: "a".to_string()
        }
    );
    assert!(start.elapsed() < TIMEOUT);
    assert_eq!(cluster.watches_started(), 4);
    assert_eq!(cluster.live_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_refuses_reads() {
    let cluster = FakeCluster::new("https://a.example.com").with_object(namespace(
        "team-a",
        btreemap! { "fleet.io/owned" => "true" },
    ));
    let store = match MemberStore::start("a", &cluster, PARAMS).await {
        Ok(store) => store,
        Err(error) => panic!("store must sync: {error}"),
    };
    let held = store.clone();

    store.stop().await;
    store.stop().await;

    assert!(held.is_stopped());
    assert!(held.ptr_eq(&store));
    assert_eq!(cluster.live_watches(), 0);
    assert_eq!(
        held.namespaces().list(&Selector::everything()).unwrap_err(),
        StoreError::Stopped {
            kind: "Namespace".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn reads_are_refused_before_sync() {
    let cluster = FakeCluster::new("https://a.example.com");
    cluster.hold_sync(true);

    let mut informers = Informers::new("a");
    let namespaces =
        member::spawn::<Namespace, _>(&mut informers, &cluster, watcher::Config::default());
    tokio::task::yield_now().await;

    assert!(!namespaces.is_synced());
    assert_eq!(
        namespaces.get("team-a").unwrap_err(),
        StoreError::NotSynced {
            kind: "Namespace".to_string()
        }
    );

    informers.stop().await;
    assert_eq!(cluster.live_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn control_plane_store_caches_clusters() {
    let client = FakeCluster::new("https://control-plane.example.com").with_object(Cluster::new(
        "a",
        ClusterSpec {
            description: None,
            kubeconfig: "apiVersion: v1".to_string(),
            wildcard_domains: vec![],
        },
    ));

    let store = match ControlPlaneStore::start(&client, TIMEOUT).await {
        Ok(store) => store,
        Err(error) => panic!("store must sync: {error}"),
    };
    let cluster = store.clusters().get("a").unwrap().expect("cluster must be cached");
    assert_eq!(cluster.spec.kubeconfig, "apiVersion: v1");

    store.stop().await;
    assert_eq!(client.live_watches(), 0);
}

fn namespace(name: &str, labels: BTreeMap<&str, &str>) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn service(namespace: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn names<K: kube::ResourceExt>(objects: &[Arc<K>]) -> Vec<String> {
    let mut names = objects.iter().map(|o| o.name_any()).collect::<Vec<_>>();
    names.sort();
    names
}
