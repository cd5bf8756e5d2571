#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Idempotent writes against any `ObjectClient`.
//!
//! `apply_resource` and `update_resource_status` resolve write conflicts by
//! re-reading the live object and retrying within a `RetryPolicy`;
//! `patch_resource` sends a single merge patch and leaves retries to the
//! caller; `delete_resource` treats an absent object as deleted. None of them
//! check whether the target cluster is reachable.

mod apply;
mod backoff;
mod delete;
mod patch;
mod status;


pub use self::{
    apply::apply_resource,
    delete::delete_resource,
    patch::{merge_patch, patch_resource},
    status::update_resource_status,
};
pub use fleet_controller_core::RetryPolicy;
