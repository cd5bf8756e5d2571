use crate::condition::{Condition, ConditionStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// The observed phases of a parent's owned sub-resources, keyed by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhaseRollup {
    phases: BTreeMap<String, String>,
}

impl PhaseRollup {
    pub fn observe(&mut self, name: impl Into<String>, phase: impl Into<String>) {
        self.phases.insert(name.into(), phase.into());
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn count_in(&self, phase: &str) -> usize {
        self.phases.values().filter(|p| *p == phase).count()
    }

    pub fn phases(&self) -> &BTreeMap<String, String> {
        &self.phases
    }

    pub fn into_phases(self) -> BTreeMap<String, String> {
        self.phases
    }

    /// True when every child is in `ready`; otherwise False, naming the
    /// children that are not.
    ///
    /// An empty rollup is ready.
    pub fn condition(&self, type_: &str, ready: &str, now: DateTime<Utc>) -> Condition {
        let pending = self
            .phases
            .iter()
            .filter(|(_, phase)| *phase != ready)
            .map(|(name, phase)| format!("{name} is {phase}"))
            .collect::<Vec<_>>();
        if pending.is_empty() {
            return Condition::new(type_, ConditionStatus::True, "", now);
        }
        Condition::new(
            type_,
            ConditionStatus::False,
            format!("{} of {} not {ready}: {}", pending.len(), self.len(), pending.join(", ")),
            now,
        )
    }
}

impl<N: Into<String>, P: Into<String>> FromIterator<(N, P)> for PhaseRollup {
    fn from_iter<I: IntoIterator<Item = (N, P)>>(iter: I) -> Self {
        let mut rollup = Self::default();
        for (name, phase) in iter {
            rollup.observe(name, phase);
        }
        rollup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ready() {
        let rollup = [("a", "Active"), ("b", "Active")]
            .into_iter()
            .collect::<PhaseRollup>();
        assert_eq!(rollup.len(), 2);
        assert_eq!(rollup.count_in("Active"), 2);
        let c = rollup.condition("SpacesReady", "Active", DateTime::<Utc>::MIN_UTC);
        assert!(c.is_true());
        assert!(c.message.is_empty());
    }

    #[test]
    fn names_pending_children() {
        let rollup = [("a", "Active"), ("b", "Terminating"), ("c", "Active")]
            .into_iter()
            .collect::<PhaseRollup>();
        let c = rollup.condition("SpacesReady", "Active", DateTime::<Utc>::MIN_UTC);
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.message, "1 of 3 not Active: b is Terminating");
    }

    #[test]
    fn later_observation_wins() {
        let mut rollup = PhaseRollup::default();
        rollup.observe("a", "Pending");
        rollup.observe("a", "Active");
        assert_eq!(rollup.len(), 1);
        assert_eq!(rollup.count_in("Pending"), 0);
    }

    #[test]
    fn empty_is_ready() {
        let c = PhaseRollup::default().condition("SpacesReady", "Active", DateTime::<Utc>::MIN_UTC);
        assert!(c.is_true());
    }
}
