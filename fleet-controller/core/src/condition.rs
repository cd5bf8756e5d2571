use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PING_PASSED: &str = "PingPassed";
pub const CACHE_SYNCED: &str = "CacheSynced";
pub const READY: &str = "Ready";
pub const GATEWAY_READY: &str = "GatewayReady";
pub const SPACES_READY: &str = "SpacesReady";

/// A typed, timestamped status entry. A condition list holds at most one entry
/// per type.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[schemars(with = "String")]
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Implemented by objects that carry a condition list.
pub trait HasConditions {
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Records the outcome of an operation under `type_`, stamped with the
    /// current time. Returns true if the status or message changed.
    fn set_status_condition<T, E: fmt::Display>(
        &mut self,
        type_: &str,
        result: &Result<T, E>,
    ) -> bool {
        self.set_status_condition_at(type_, result, Utc::now())
    }

    fn set_status_condition_at<T, E: fmt::Display>(
        &mut self,
        type_: &str,
        result: &Result<T, E>,
        now: DateTime<Utc>,
    ) -> bool {
        set_status_condition(
            self.conditions_mut(),
            Condition::from_result(type_, result, now),
        )
    }

    fn delete_status_condition(&mut self, type_: &str) -> Option<Condition> {
        delete_status_condition(self.conditions_mut(), type_)
    }
}

/// Sets `condition`, replacing an existing entry of the same type in place.
///
/// Timestamps never move backwards: if the existing entry is newer than the
/// incoming one, its timestamp is kept. Returns true if the status or message
/// of the list changed.
pub fn set_status_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if condition.last_transition_time < existing.last_transition_time {
                condition.last_transition_time = existing.last_transition_time;
            }
            let changed =
                existing.status != condition.status || existing.message != condition.message;
            *existing = condition;
            changed
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Removes the entry of the given type, if any.
pub fn delete_status_condition(conditions: &mut Vec<Condition>, type_: &str) -> Option<Condition> {
    let idx = conditions.iter().position(|c| c.type_ == type_)?;
    Some(conditions.remove(idx))
}

pub fn find_status_condition<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

// === impl Condition ===

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            message: message.into(),
            last_transition_time: now,
        }
    }

    /// True with an empty message on success; False with the error's message
    /// otherwise.
    pub fn from_result<T, E: fmt::Display>(
        type_: impl Into<String>,
        result: &Result<T, E>,
        now: DateTime<Utc>,
    ) -> Self {
        match result {
            Ok(_) => Self::new(type_, ConditionStatus::True, "", now),
            Err(error) => Self::new(type_, ConditionStatus::False, error.to_string(), now),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

impl HasConditions for Vec<Condition> {
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        self
    }
}

// === impl ConditionStatus ===

impl From<bool> for ConditionStatus {
    fn from(ok: bool) -> Self {
        if ok {
            Self::True
        } else {
            Self::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => "True".fmt(f),
            Self::False => "False".fmt(f),
            Self::Unknown => "Unknown".fmt(f),
        }
    }
}
