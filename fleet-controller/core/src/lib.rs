#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod condition;
mod phase;
mod retry;
pub mod rollup;

pub use self::{
    condition::{Condition, ConditionStatus, HasConditions},
    phase::ConnectionPhase,
    retry::RetryPolicy,
    rollup::PhaseRollup,
};
