#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod connect;
mod handle;
mod index;
mod metrics;
mod registry;


pub use self::{
    connect::{ConfigHash, Connect, ConnectError, KubeConnector},
    handle::{ClusterHandle, HandleParams, Snapshot, Unreachable},
    index::{ClusterIndex, SharedIndex},
    metrics::Metrics,
    registry::{ClusterEvent, Registry, SharedRegistry},
};
