use crate::{
    cache::ControlPlaneStore,
    clusters::{ClusterIndex, HandleParams, KubeConnector, Metrics, Registry},
    core::RetryPolicy,
    k8s::{self, watcher, Cluster, KubeClient},
    status::{Controller, ControllerMetrics},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry as Prometheus;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "fleet", about = "A multi-cluster fleet controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "fleet=info,warn",
        env = "FLEET_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Deadline for every cache's initial sync.
    #[clap(long, default_value = "30")]
    cache_sync_timeout_secs: u64,

    #[clap(long, default_value = "5000")]
    ping_timeout_ms: u64,

    #[clap(long, default_value = "15")]
    health_check_interval_secs: u64,

    #[clap(long, default_value = "15")]
    status_interval_secs: u64,

    /// Bound on one cluster's status reconciliation, member writes included.
    #[clap(long, default_value = "5000")]
    write_timeout_ms: u64,

    /// Conflict retry budget for object and status writes.
    #[clap(long, default_value = "5")]
    write_retry_attempts: u32,

    /// First conflict backoff; doubles on each retry, up to one second.
    #[clap(long, default_value = "10")]
    write_retry_base_delay_ms: u64,

    /// Namespace for platform-owned objects in member clusters.
    #[clap(long, default_value = k8s::BUILTIN_NAMESPACE)]
    builtin_namespace: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            cache_sync_timeout_secs,
            ping_timeout_ms,
            health_check_interval_secs,
            status_interval_secs,
            write_timeout_ms,
            write_retry_attempts,
            write_retry_base_delay_ms,
            builtin_namespace,
        } = self;

        let sync_timeout = Duration::from_secs(cache_sync_timeout_secs);
        let params = HandleParams {
            sync_timeout,
            ping_timeout: Duration::from_millis(ping_timeout_ms),
        };
        let retry = RetryPolicy::new(
            write_retry_attempts,
            Duration::from_millis(write_retry_base_delay_ms),
        );

        let mut prom = <Prometheus>::default();
        let cluster_metrics = Metrics::register(prom.sub_registry_with_prefix("clusters"));
        let status_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("cluster_status"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // The control plane's own caches must sync before anything else
        // starts; unlike member clusters, there is nothing to fall back to.
        let control_plane = KubeClient::from_client(runtime.client(), "control-plane");
        let store = ControlPlaneStore::start(&control_plane, sync_timeout)
            .await
            .context("control-plane caches did not sync")?;
        info!("Control-plane caches synced");

        let registry = Arc::new(Registry::new(KubeConnector::default(), params, cluster_metrics));

        // Cluster watch events are turned into registry events by the index.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let index = ClusterIndex::shared(events_tx);
        let clusters = runtime.watch_all::<Cluster>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index, clusters).instrument(info_span!("clusters")),
        );
        tokio::spawn(
            registry
                .clone()
                .run(events_rx)
                .instrument(info_span!("registry")),
        );
        tokio::spawn(
            registry
                .clone()
                .run_health_checks(
                    Duration::from_secs(health_check_interval_secs),
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("health_checks")),
        );

        let status_controller = Controller::new(
            control_plane.typed(),
            store,
            registry,
            builtin_namespace,
            retry,
            Duration::from_millis(write_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run(
                    Duration::from_secs(status_interval_secs),
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("status_controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to release it before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
