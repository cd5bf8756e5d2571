use super::*;
use crate::{ClusterEvent, Registry};
use fleet_controller_core::ConnectionPhase;
use tokio::time::Instant;

fn registry(connector: FakeConnector) -> Arc<Registry<FakeConnector>> {
    Arc::new(Registry::new(connector, params(), Metrics::default()))
}

fn added(name: &str, kubeconfig: &str) -> ClusterEvent {
    ClusterEvent::Added {
        name: name.to_string(),
        kubeconfig: kubeconfig.to_string(),
    }
}

fn updated(name: &str, kubeconfig: &str) -> ClusterEvent {
    ClusterEvent::Updated {
        name: name.to_string(),
        kubeconfig: kubeconfig.to_string(),
    }
}

fn deleted(name: &str) -> ClusterEvent {
    ClusterEvent::Deleted {
        name: name.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn cluster_lifecycle() {
    let first = member("https://a-1.example.com");
    let second = member("https://a-2.example.com");
    let registry = registry(
        FakeConnector::default()
            .with("kc-1", first.clone())
            .with("kc-2", second.clone()),
    );

    // Added: the handle is registered immediately and connects in the
    // background.
    let task = registry
        .handle_event(added("cluster-a", "kc-1"))
        .await
        .expect("a new cluster must connect");
    let handle = registry.get("cluster-a").expect("handle must be registered");
    task.await.unwrap();
    assert_eq!(handle.phase(), ConnectionPhase::Connected);
    let store = handle.store().unwrap();
    assert_eq!(registry.metrics().handles(), 1);

    // Updated with the same kubeconfig: nothing changes.
    assert!(registry
        .handle_event(updated("cluster-a", "kc-1"))
        .await
        .is_none());
    let same = registry.get("cluster-a").unwrap();
    assert!(Arc::ptr_eq(&handle, &same));
    assert!(same.store().unwrap().ptr_eq(&store));
    assert_eq!(registry.metrics().cache_syncs("cluster-a"), 1);

    // Updated with a new kubeconfig: the same handle rebuilds its cache.
    let task = registry
        .handle_event(updated("cluster-a", "kc-2"))
        .await
        .expect("a changed kubeconfig must reconnect");
    task.await.unwrap();
    let rebuilt = registry.get("cluster-a").unwrap();
    assert!(Arc::ptr_eq(&handle, &rebuilt));
    assert_eq!(rebuilt.phase(), ConnectionPhase::Connected);
    assert!(store.is_stopped());
    assert!(!rebuilt.store().unwrap().ptr_eq(&store));
    assert_eq!(first.live_watches(), 0);
    assert_eq!(second.live_watches(), 4);
    assert_eq!(registry.metrics().cache_syncs("cluster-a"), 2);
    assert_eq!(
        registry
            .metrics()
            .phase_transitions("cluster-a", ConnectionPhase::Connecting),
        1
    );
    assert_eq!(
        registry
            .metrics()
            .phase_transitions("cluster-a", ConnectionPhase::Connected),
        2
    );

    // Deleted: the handle is gone and its informers are stopped.
    assert!(registry.handle_event(deleted("cluster-a")).await.is_none());
    assert!(registry.get("cluster-a").is_none());
    assert!(handle.is_stopped());
    assert_eq!(second.live_watches(), 0);
    assert_eq!(registry.metrics().handles(), 0);
}

#[tokio::test(start_paused = true)]
async fn update_for_unknown_cluster_adds_it() {
    let cluster = member("https://a.example.com");
    let registry = registry(FakeConnector::default().with("kc-a", cluster.clone()));

    let task = registry
        .handle_event(updated("a", "kc-a"))
        .await
        .expect("an unknown cluster must connect");
    task.await.unwrap();

    assert_eq!(
        registry.get("a").map(|h| h.phase()),
        Some(ConnectionPhase::Connected)
    );
}

#[tokio::test(start_paused = true)]
async fn set_stops_replaced_handle() {
    let cluster = member("https://a.example.com");
    let registry = registry(FakeConnector::default().with("kc-a", cluster.clone()));

    let old = registry.new_handle("a");
    old.connect("kc-a").await;
    registry.set("a", old.clone()).await;
    assert_eq!(cluster.live_watches(), 4);

    let new = registry.new_handle("a");
    registry.set("a", new.clone()).await;

    assert!(old.is_stopped());
    assert_eq!(cluster.live_watches(), 0);
    assert!(Arc::ptr_eq(&registry.get("a").unwrap(), &new));
    assert_eq!(registry.len(), 1);

    // Setting the registered handle again leaves it running.
    registry.set("a", new.clone()).await;
    assert!(!new.is_stopped());
}

#[tokio::test]
async fn forget_unknown_cluster() {
    let registry = registry(FakeConnector::default());
    assert!(!registry.forget("a").await);
    assert!(registry.handle_event(deleted("a")).await.is_none());
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn forget_cancels_inflight_connect() {
    let cluster = member("https://a.example.com");
    cluster.set_ping_delay(Some(Duration::from_secs(1)));
    let registry = registry(FakeConnector::default().with("kc-a", cluster.clone()));

    let start = Instant::now();
    let task = registry.handle_event(added("a", "kc-a")).await.unwrap();
    let handle = registry.get("a").unwrap();
    while handle.generation() == 0 {
        tokio::task::yield_now().await;
    }

    assert!(registry.forget("a").await);

    assert!(start.elapsed() < Duration::from_secs(1));
    task.await.unwrap();
    assert!(handle.is_stopped());
    assert_eq!(handle.phase(), ConnectionPhase::Disconnected);
    assert_eq!(registry.metrics().cache_syncs("a"), 0);
    assert_eq!(cluster.watches_started(), 0);
    assert!(registry.get("a").is_none());
}

#[tokio::test(start_paused = true)]
async fn deleting_a_syncing_cluster_does_not_stall_events() {
    let slow = member("https://slow.example.com");
    slow.hold_sync(true);
    let fast = member("https://fast.example.com");
    let registry = registry(
        FakeConnector::default()
            .with("kc-slow", slow.clone())
            .with("kc-fast", fast.clone()),
    );
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let run = tokio::spawn(registry.clone().run(rx));

    let start = Instant::now();
    tx.send(added("slow", "kc-slow")).unwrap();
    while slow.watches_started() < 4 {
        tokio::task::yield_now().await;
    }
    tx.send(deleted("slow")).unwrap();
    tx.send(added("fast", "kc-fast")).unwrap();

    let handle = loop {
        if let Some(handle) = registry.get("fast") {
            break handle;
        }
        tokio::task::yield_now().await;
    };
    handle
        .phases()
        .wait_for(|phase| phase.is_connected())
        .await
        .expect("handle must not be dropped");

    assert!(start.elapsed() < params().sync_timeout);
    assert!(registry.get("slow").is_none());
    assert_eq!(slow.live_watches(), 0);
    assert_eq!(registry.metrics().cache_syncs("slow"), 0);

    drop(tx);
    run.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn different_names_are_independent() {
    let slow = member("https://slow.example.com");
    slow.set_ping_delay(Some(Duration::from_secs(4)));
    let fast = member("https://fast.example.com");
    let registry = registry(
        FakeConnector::default()
            .with("kc-slow", slow.clone())
            .with("kc-fast", fast.clone()),
    );

    let slow_task = registry.handle_event(added("slow", "kc-slow")).await.unwrap();
    let start = Instant::now();
    let fast_task = registry.handle_event(added("fast", "kc-fast")).await.unwrap();
    fast_task.await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(
        registry.get("fast").unwrap().phase(),
        ConnectionPhase::Connected
    );
    assert_eq!(
        registry.get("slow").unwrap().phase(),
        ConnectionPhase::Connecting
    );

    slow_task.await.unwrap();
    assert_eq!(
        registry
            .list()
            .iter()
            .map(|h| h.name().to_string())
            .collect::<Vec<_>>(),
        vec!["fast", "slow"]
    );
}

#[tokio::test(start_paused = true)]
async fn health_checks_run_until_shutdown() {
    let cluster = member("https://a.example.com");
    let registry = registry(FakeConnector::default().with("kc-a", cluster.clone()));
    registry
        .handle_event(added("a", "kc-a"))
        .await
        .unwrap()
        .await
        .unwrap();
    let handle = registry.get("a").unwrap();

    let (signal, watch) = drain::channel();
    let checks = tokio::spawn(
        registry
            .clone()
            .run_health_checks(Duration::from_secs(15), watch),
    );

    cluster.set_healthy(false);
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(handle.phase(), ConnectionPhase::Disconnected);

    cluster.set_healthy(true);
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(handle.phase(), ConnectionPhase::Connected);

    signal.drain().await;
    checks.await.unwrap();
    assert!(registry.is_empty());
    assert!(handle.is_stopped());
    assert_eq!(cluster.live_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn run_consumes_events_in_order() {
    let cluster = member("https://a.example.com");
    let registry = registry(FakeConnector::default().with("kc-a", cluster.clone()));
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tx.send(added("a", "kc-a")).unwrap();
    tx.send(added("b", "kc-unknown")).unwrap();
    tx.send(deleted("b")).unwrap();
    drop(tx);
    registry.clone().run(rx).await;

    assert!(registry.get("b").is_none());
    let handle = registry.get("a").expect("a must be registered");
    let mut phases = handle.phases();
    phases
        .wait_for(|phase| phase.is_connected())
        .await
        .expect("handle must not be dropped");
}
