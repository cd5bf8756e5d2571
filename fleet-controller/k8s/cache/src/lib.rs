#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod control_plane;
mod informer;
mod member;

#[cfg(test)]
mod tests;

pub use self::{
    control_plane::ControlPlaneStore,
    informer::{Cached, Lister},
    member::{MemberStore, StoreParams},
};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} cache has not synced")]
    NotSynced { kind: String },

    #[error("{kind} cache has been stopped")]
    Stopped { kind: String },

    #[error(
        "{cluster}: caches did not sync within {timeout:?}: {}",
        .kinds.join(", ")
    )]
    SyncTimeout {
        cluster: String,
        kinds: Vec<String>,
        timeout: Duration,
    },

    #[error("{cluster}: {kind} watch terminated before its cache synced")]
    Terminated { cluster: String, kind: String },

    #[error("{cluster}: cache start was cancelled")]
    Cancelled { cluster: String },
}
