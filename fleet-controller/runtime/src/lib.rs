#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use fleet_controller_core as core;
pub use fleet_controller_k8s_api as k8s;
pub use fleet_controller_k8s_cache as cache;
pub use fleet_controller_k8s_clusters as clusters;
pub use fleet_controller_k8s_reconcile as reconcile;

mod args;
mod status;

pub use self::{
    args::Args,
    status::{Controller, ControllerMetrics, MemberClients},
};
