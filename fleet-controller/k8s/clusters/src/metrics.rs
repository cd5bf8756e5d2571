use fleet_controller_core::ConnectionPhase;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    handles: Gauge,
    connects: Family<ResultLabels, Counter>,
    cache_syncs: Family<ClusterLabels, Counter>,
    pings: Family<ResultLabels, Counter>,
    phase_transitions: Family<PhaseLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ClusterLabels {
    cluster: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    cluster: String,
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PhaseLabels {
    cluster: String,
    phase: String,
}

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        let handles = Gauge::default();
        prom.register(
            "handles",
            "Gauge of the number of cluster handles in the registry",
            handles.clone(),
        );

        let connects = Family::default();
        prom.register(
            "connects",
            "Count of connection attempts by cluster and result",
            connects.clone(),
        );

        let cache_syncs = Family::default();
        prom.register(
            "cache_syncs",
            "Count of member cache stores that completed their initial sync",
            cache_syncs.clone(),
        );

        let pings = Family::default();
        prom.register(
            "pings",
            "Count of health-check pings by cluster and result",
            pings.clone(),
        );

        let phase_transitions = Family::default();
        prom.register(
            "phase_transitions",
            "Count of connection phase changes by cluster and new phase",
            phase_transitions.clone(),
        );

        Self {
            handles,
            connects,
            cache_syncs,
            pings,
            phase_transitions,
        }
    }

    pub fn cache_syncs(&self, cluster: &str) -> u64 {
        self.cache_syncs
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .get()
    }

    pub fn phase_transitions(&self, cluster: &str, phase: ConnectionPhase) -> u64 {
        self.phase_transitions
            .get_or_create(&PhaseLabels {
                cluster: cluster.to_string(),
                phase: phase.to_string(),
            })
            .get()
    }

    pub fn handles(&self) -> i64 {
        self.handles.get()
    }

    pub(crate) fn set_handles(&self, n: usize) {
        self.handles.set(n as i64);
    }

    pub(crate) fn connected(&self, cluster: &str, ok: bool) {
        self.connects.get_or_create(&result(cluster, ok)).inc();
    }

    pub(crate) fn cache_synced(&self, cluster: &str) {
        self.cache_syncs
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .inc();
    }

    pub(crate) fn pinged(&self, cluster: &str, ok: bool) {
        self.pings.get_or_create(&result(cluster, ok)).inc();
    }

    pub(crate) fn phase_changed(&self, cluster: &str, phase: ConnectionPhase) {
        self.phase_transitions
            .get_or_create(&PhaseLabels {
                cluster: cluster.to_string(),
                phase: phase.to_string(),
            })
            .inc();
    }
}

fn result(cluster: &str, ok: bool) -> ResultLabels {
    ResultLabels {
        cluster: cluster.to_string(),
        result: if ok { "ok" } else { "error" }.to_string(),
    }
}
