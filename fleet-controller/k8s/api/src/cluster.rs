use fleet_controller_core::{Condition, ConnectionPhase, HasConditions};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marks objects owned by the platform.
pub const OWNED_LABEL: &str = "fleet.io/owned";

/// Names the member cluster an object belongs to.
pub const CLUSTER_LABEL: &str = "fleet.io/cluster";

/// A member cluster, reachable through the stored kubeconfig.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".status.server"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub kubeconfig: String,

    #[serde(default)]
    pub wildcard_domains: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ConnectionPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Phases of the cluster's spaces, keyed by namespace.
    #[serde(default)]
    pub spaces: BTreeMap<String, String>,

    #[serde(default)]
    pub space_count: u32,
}

// === impl Cluster ===

impl Cluster {
    /// Sets the owned and cluster-name labels. Returns true if either changed.
    pub fn ensure_required_labels(&mut self) -> bool {
        let name = self.name_any();
        let labels = self.labels_mut();
        let mut changed = false;
        for (key, value) in [(OWNED_LABEL, "true".to_string()), (CLUSTER_LABEL, name)] {
            if labels.get(key) != Some(&value) {
                labels.insert(key.to_string(), value);
                changed = true;
            }
        }
        changed
    }

    pub fn status_mut(&mut self) -> &mut ClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl HasConditions for ClusterStatus {
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}
