#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
pub mod cluster;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod labels;
mod object;

pub use self::{
    client::{ClusterClient, KubeClient, WatchStream},
    cluster::{Cluster, ClusterSpec, ClusterStatus, CLUSTER_LABEL, OWNED_LABEL},
    labels::{Expression, Selector},
    object::{is_conflict, is_not_found, ApiScope, DynamicClient, ObjectClient, TypedClient},
};
pub use k8s_openapi::api::{
    self,
    apps::v1::Deployment,
    core::v1::{ConfigMap, Namespace, Service},
    networking::v1::IngressClass,
};
pub use kube::{
    api::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, ResourceExt, TypeMeta},
    runtime::watcher,
    Client, Error, Resource,
};

/// Namespace holding platform-owned objects in member clusters.
pub const BUILTIN_NAMESPACE: &str = "fleet-system";

pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

pub fn gateway_class_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GATEWAY_API_GROUP, "v1", "GatewayClass"))
}

pub fn gateway_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GATEWAY_API_GROUP, "v1", "Gateway"))
}

/// Selects objects owned by the platform.
pub fn owned_selector() -> Selector {
    Selector::from_iter(Some((OWNED_LABEL, "true")))
}

/// Selects namespaces assigned to any cluster, owned or not.
pub fn space_selector() -> Selector {
    Selector::from_iter(Some(Expression::exists(CLUSTER_LABEL)))
}
