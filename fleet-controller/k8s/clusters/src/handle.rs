use crate::{
    connect::{ConfigHash, Connect},
    metrics::Metrics,
};
use anyhow::bail;
use chrono::Utc;
use fleet_controller_core::{
    condition::{CACHE_SYNCED, PING_PASSED, READY},
    Condition, ConnectionPhase, HasConditions,
};
use fleet_controller_k8s_api::{
    ApiResource, ClusterClient, DynamicClient, KubeClient, TypedClient,
};
use fleet_controller_k8s_cache::{MemberStore, StoreError, StoreParams};
use futures::prelude::*;
use parking_lot::RwLock;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex, MutexGuard},
    time,
};
use tracing::{debug, info};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandleParams {
    /// Deadline for the member cache's sync barrier.
    pub sync_timeout: Duration,
    /// Bound on a single ping, version or discovery request.
    pub ping_timeout: Duration,
}

/// Returned by accessors when the cluster is not Connected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("cluster {cluster} is unreachable ({phase})")]
pub struct Unreachable {
    pub cluster: String,
    pub phase: ConnectionPhase,
}

/// A point-in-time copy of a handle's observable state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub phase: ConnectionPhase,
    pub conditions: Vec<Condition>,
    pub server: Option<String>,
    pub version: Option<String>,
    /// Incremented on every connection attempt.
    pub generation: u64,
}

/// The live connection to one member cluster.
///
/// A handle is created once per cluster name and keeps its identity across
/// kubeconfig changes: `reset` rebuilds its client and cache in place. All
/// connection attempts and teardown are serialized by an internal lock, so at
/// most one member cache exists per handle at any time. Stopping a handle
/// cancels a connection attempt that is still in progress.
pub struct ClusterHandle<C: Connect> {
    name: String,
    connector: Arc<C>,
    params: HandleParams,
    metrics: Metrics,
    lifecycle: Mutex<()>,
    state: RwLock<State<C::Client>>,
    phase_tx: watch::Sender<ConnectionPhase>,
    stop_tx: watch::Sender<bool>,
}

struct State<T> {
    phase: ConnectionPhase,
    conditions: Vec<Condition>,
    desired: Option<Desired>,
    attempted: Option<ConfigHash>,
    live: Option<Live<T>>,
    generation: u64,
    server: Option<String>,
    version: Option<String>,
    stopped: bool,
}

#[derive(Clone)]
struct Desired {
    kubeconfig: Arc<str>,
    hash: ConfigHash,
}

struct Live<T> {
    client: T,
    store: MemberStore,
    generation: u64,
}

struct Established<T> {
    client: T,
    store: MemberStore,
    version: Option<String>,
}

enum Failure {
    Unreachable(String),
    NotSynced { server: String, message: String },
    Stopped,
}

// === impl HandleParams ===

impl Default for HandleParams {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

// === impl ClusterHandle ===

impl<C: Connect> ClusterHandle<C> {
    pub(crate) fn new(
        name: impl Into<String>,
        connector: Arc<C>,
        params: HandleParams,
        metrics: Metrics,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ConnectionPhase::Connecting);
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            connector,
            params,
            metrics,
            lifecycle: Mutex::new(()),
            state: RwLock::new(State {
                phase: ConnectionPhase::Connecting,
                conditions: Vec::new(),
                desired: None,
                attempted: None,
                live: None,
                generation: 0,
                server: None,
                version: None,
                stopped: false,
            }),
            phase_tx,
            stop_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.read().phase
    }

    /// Observes phase changes.
    pub fn phases(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.state.read().conditions.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        Snapshot {
            phase: state.phase,
            conditions: state.conditions.clone(),
            server: state.server.clone(),
            version: state.version.clone(),
            generation: state.generation,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.read().stopped
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The member cluster's client, while Connected.
    pub fn client(&self) -> Result<C::Client, Unreachable> {
        let state = self.state.read();
        match &state.live {
            Some(live) if state.phase.is_connected() => Ok(live.client.clone()),
            _ => Err(self.unreachable(state.phase)),
        }
    }

    /// The member cluster's cache, while Connected.
    pub fn store(&self) -> Result<MemberStore, Unreachable> {
        let state = self.state.read();
        match &state.live {
            Some(live) if state.phase.is_connected() => Ok(live.store.clone()),
            _ => Err(self.unreachable(state.phase)),
        }
    }

    /// Connects with `kubeconfig`, replacing any existing connection.
    ///
    /// Failures are recorded in the handle's conditions and leave it
    /// Disconnected; the resulting phase is returned.
    pub async fn connect(&self, kubeconfig: &str) -> ConnectionPhase {
        let guard = self.lifecycle.lock().await;
        self.request(kubeconfig);
        self.converge(&guard, true).await;
        self.phase()
    }

    /// Rebuilds the connection if `kubeconfig` differs from the last one
    /// requested. Returns whether a rebuild happened.
    pub async fn reset(&self, kubeconfig: &str) -> bool {
        if !self.request(kubeconfig) {
            debug!(cluster = %self.name, "Kubeconfig unchanged");
            return false;
        }
        self.reconcile().await;
        true
    }

    /// Records the desired kubeconfig without connecting. Returns true if it
    /// changed.
    pub(crate) fn request(&self, kubeconfig: &str) -> bool {
        let hash = ConfigHash::of(kubeconfig);
        let mut state = self.state.write();
        if state.desired.as_ref().map(|d| d.hash) == Some(hash) {
            return false;
        }
        debug!(cluster = %self.name, %hash, "Kubeconfig requested");
        state.desired = Some(Desired {
            kubeconfig: kubeconfig.into(),
            hash,
        });
        true
    }

    /// Connects with the desired kubeconfig unless it was already attempted.
    pub(crate) async fn reconcile(&self) {
        let guard = self.lifecycle.lock().await;
        self.converge(&guard, false).await;
    }

    /// Checks that the API server is still reachable and updates the phase.
    ///
    /// A handle with no live connection is reconnected instead, unless a
    /// connection attempt is already under way.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let live = {
            let mut state = self.state.write();
            if state.stopped {
                bail!("cluster {} handle is stopped", self.name);
            }
            let live = state
                .live
                .as_ref()
                .map(|live| (live.client.clone(), live.generation));
            if live.is_some() && state.phase == ConnectionPhase::Disconnected {
                self.transition(&mut state, ConnectionPhase::Connecting);
            }
            live
        };
        let Some((client, generation)) = live else {
            return self.reconnect().await;
        };

        let result = check_reachable(&client, self.params.ping_timeout).await;
        self.metrics.pinged(&self.name, result.is_ok());

        let mut state = self.state.write();
        let current = state.live.as_ref().map(|live| live.generation);
        if state.stopped || current != Some(generation) {
            debug!(cluster = %self.name, "Ping superseded by a reconnect");
            return result.map_err(anyhow::Error::msg);
        }
        let now = Utc::now();
        state
            .conditions
            .set_status_condition_at(PING_PASSED, &result, now);
        state.conditions.set_status_condition_at(READY, &result, now);
        match result {
            Ok(()) => {
                self.transition(&mut state, ConnectionPhase::Connected);
                Ok(())
            }
            Err(message) => {
                info!(cluster = %self.name, error = %message, "Ping failed");
                self.transition(&mut state, ConnectionPhase::Disconnected);
                bail!(message)
            }
        }
    }

    /// Stops the member cache and marks the handle Disconnected for good.
    /// A connection attempt in progress is abandoned rather than awaited.
    /// Later calls do nothing.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let _guard = self.lifecycle.lock().await;
        let live = {
            let mut state = self.state.write();
            if state.stopped {
                return;
            }
            state.stopped = true;
            let stopped: Result<(), &str> = Err("cluster handle stopped");
            state
                .conditions
                .set_status_condition_at(READY, &stopped, Utc::now());
            self.transition(&mut state, ConnectionPhase::Disconnected);
            state.live.take()
        };
        if let Some(live) = live {
            live.store.stop().await;
        }
        info!(cluster = %self.name, "Stopped");
    }

    async fn reconnect(&self) -> anyhow::Result<()> {
        let Ok(guard) = self.lifecycle.try_lock() else {
            bail!("cluster {} is connecting", self.name);
        };
        if self.state.read().desired.is_none() {
            bail!("cluster {} has no kubeconfig", self.name);
        }
        self.converge(&guard, true).await;
        match self.phase() {
            ConnectionPhase::Connected => Ok(()),
            phase => Err(self.unreachable(phase).into()),
        }
    }

    /// Tears down the current connection and connects with the desired
    /// kubeconfig. The old cache is fully stopped before a new one starts.
    async fn converge(&self, _guard: &MutexGuard<'_, ()>, force: bool) {
        let (desired, generation, old) = {
            let mut state = self.state.write();
            if state.stopped {
                return;
            }
            let Some(desired) = state.desired.clone() else {
                return;
            };
            if !force && state.attempted == Some(desired.hash) {
                return;
            }
            state.attempted = Some(desired.hash);
            state.generation += 1;
            self.transition(&mut state, ConnectionPhase::Connecting);
            let generation = state.generation;
            (desired, generation, state.live.take())
        };

        if let Some(old) = old {
            debug!(cluster = %self.name, generation = old.generation, "Stopping previous cache");
            old.store.stop().await;
        }

        info!(cluster = %self.name, hash = %desired.hash, generation, "Connecting");
        let result = self.establish(&desired.kubeconfig).await;
        if let Err(Failure::Stopped) = result {
            debug!(cluster = %self.name, generation, "Connection attempt cancelled");
            return;
        }
        self.metrics.connected(&self.name, result.is_ok());

        let now = Utc::now();
        let mut state = self.state.write();
        match result {
            Ok(Established {
                client,
                store,
                version,
            }) => {
                let ok: Result<(), String> = Ok(());
                state.conditions.set_status_condition_at(PING_PASSED, &ok, now);
                state
                    .conditions
                    .set_status_condition_at(CACHE_SYNCED, &ok, now);
                state.conditions.set_status_condition_at(READY, &ok, now);
                state.server = Some(client.server());
                state.version = version;
                state.live = Some(Live {
                    client,
                    store,
                    generation,
                });
                self.metrics.cache_synced(&self.name);
                self.transition(&mut state, ConnectionPhase::Connected);
            }
            Err(Failure::Unreachable(message)) => {
                info!(cluster = %self.name, error = %message, "Failed to connect");
                let failed: Result<(), String> = Err(non_empty(message));
                state
                    .conditions
                    .set_status_condition_at(PING_PASSED, &failed, now);
                state.conditions.delete_status_condition(CACHE_SYNCED);
                state.conditions.set_status_condition_at(READY, &failed, now);
                self.transition(&mut state, ConnectionPhase::Disconnected);
            }
            Err(Failure::NotSynced { server, message }) => {
                info!(cluster = %self.name, error = %message, "Cache did not sync");
                let ok: Result<(), String> = Ok(());
                let failed: Result<(), String> = Err(non_empty(message));
                state.conditions.set_status_condition_at(PING_PASSED, &ok, now);
                state
                    .conditions
                    .set_status_condition_at(CACHE_SYNCED, &failed, now);
                state.conditions.set_status_condition_at(READY, &failed, now);
                state.server = Some(server);
                self.transition(&mut state, ConnectionPhase::Disconnected);
            }
            Err(Failure::Stopped) => {}
        }
    }

    async fn establish(&self, kubeconfig: &str) -> Result<Established<C::Client>, Failure> {
        let timeout = self.params.ping_timeout;
        let client = self
            .unless_stopped(self.connector.connect(kubeconfig))
            .await?
            .map_err(|error| Failure::Unreachable(error.to_string()))?;

        self.unless_stopped(check_reachable(&client, timeout))
            .await?
            .map_err(Failure::Unreachable)?;

        let version = match self
            .unless_stopped(time::timeout(timeout, client.server_version()))
            .await?
        {
            Ok(Ok(version)) => Some(version),
            Ok(Err(error)) => {
                debug!(cluster = %self.name, %error, "Failed to read server version");
                None
            }
            Err(_) => {
                info!(cluster = %self.name, ?timeout, "Server version request timed out");
                None
            }
        };

        let params = StoreParams {
            discovery_timeout: timeout,
            sync_timeout: self.params.sync_timeout,
        };
        let store = MemberStore::start_until(&self.name, &client, params, self.stopping())
            .await
            .map_err(|error| match error {
                StoreError::Cancelled { .. } => Failure::Stopped,
                error => Failure::NotSynced {
                    server: client.server(),
                    message: error.to_string(),
                },
            })?;

        Ok(Established {
            client,
            store,
            version,
        })
    }

    /// Completes once `stop` has been called.
    async fn stopping(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    async fn unless_stopped<F: Future>(&self, fut: F) -> Result<F::Output, Failure> {
        tokio::select! {
            output = fut => Ok(output),
            () = self.stopping() => Err(Failure::Stopped),
        }
    }

    fn transition(&self, state: &mut State<C::Client>, phase: ConnectionPhase) {
        if state.phase == phase {
            return;
        }
        info!(cluster = %self.name, from = %state.phase, to = %phase, "Phase changed");
        state.phase = phase;
        self.metrics.phase_changed(&self.name, phase);
        self.phase_tx.send_replace(phase);
    }

    fn unreachable(&self, phase: ConnectionPhase) -> Unreachable {
        Unreachable {
            cluster: self.name.clone(),
            phase,
        }
    }
}

impl<C: Connect<Client = KubeClient>> ClusterHandle<C> {
    /// A typed object client for the member cluster, while Connected.
    pub fn typed_client(&self) -> Result<TypedClient, Unreachable> {
        Ok(self.client()?.typed())
    }

    /// A dynamic object client for `resource`, while Connected.
    pub fn dynamic_client(&self, resource: ApiResource) -> Result<DynamicClient, Unreachable> {
        Ok(self.client()?.dynamic(resource))
    }
}

impl<C: Connect> fmt::Debug for ClusterHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ClusterHandle")
            .field("name", &self.name)
            .field("phase", &state.phase)
            .field("generation", &state.generation)
            .field("stopped", &state.stopped)
            .finish_non_exhaustive()
    }
}

async fn check_reachable<T: ClusterClient>(client: &T, timeout: Duration) -> Result<(), String> {
    match time::timeout(timeout, client.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(format!("{error:#}")),
        Err(_) => Err(format!("ping timed out after {timeout:?}")),
    }
}

fn non_empty(message: String) -> String {
    if message.trim().is_empty() {
        "unknown error".to_string()
    } else {
        message
    }
}
