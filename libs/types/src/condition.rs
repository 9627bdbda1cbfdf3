//! Status conditions.
//!
//! A condition is a named, timestamped boolean-with-reason. The transition
//! time only moves when the status value changes, so setting the same
//! condition twice leaves the set unchanged.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition types used on orphans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// Gate for physical data deletion.
    DataCleanable,

    /// Last cleanup attempt failed.
    Error,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataCleanable => "DataCleanable",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Conditions kept sorted by type, at most one per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a condition by type.
    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    /// Status of a condition; `Unknown` when unset.
    pub fn status(&self, condition_type: ConditionType) -> ConditionStatus {
        self.get(condition_type)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }

    /// Returns true only if the condition is present and exactly `True`.
    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.status(condition_type) == ConditionStatus::True
    }

    /// Set a condition, stamping transitions with the current time.
    pub fn set(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.set_at(condition_type, status, reason, message, Utc::now());
    }

    /// Set a condition with an explicit transition time.
    ///
    /// `now` is only recorded if the status value changes (or the condition
    /// is new).
    pub fn set_at(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();

        match self.0.iter_mut().find(|c| c.condition_type == condition_type) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
            }
            None => {
                self.0.push(Condition {
                    condition_type,
                    status,
                    reason,
                    message,
                    last_transition_time: now,
                });
                self.0.sort_by_key(|c| c.condition_type);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_unset_condition_is_unknown() {
        let conditions = Conditions::new();
        assert_eq!(
            conditions.status(ConditionType::DataCleanable),
            ConditionStatus::Unknown
        );
        assert!(!conditions.is_true(ConditionType::DataCleanable));
    }

    #[test]
    fn test_set_keeps_sorted_by_type() {
        let mut conditions = Conditions::new();
        conditions.set(ConditionType::Error, ConditionStatus::False, "", "");
        conditions.set(ConditionType::DataCleanable, ConditionStatus::True, "", "");

        let json = serde_json::to_value(&conditions).unwrap();
        assert_eq!(json[0]["type"], "DataCleanable");
        assert_eq!(json[1]["type"], "Error");
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::seconds(20);

        let mut conditions = Conditions::new();
        conditions.set_at(ConditionType::DataCleanable, ConditionStatus::True, "", "", t0);
        conditions.set_at(ConditionType::DataCleanable, ConditionStatus::True, "", "", t1);
        assert_eq!(
            conditions.get(ConditionType::DataCleanable).unwrap().last_transition_time,
            t0
        );

        conditions.set_at(
            ConditionType::DataCleanable,
            ConditionStatus::False,
            "NodeEvicted",
            "",
            t2,
        );
        let c = conditions.get(ConditionType::DataCleanable).unwrap();
        assert_eq!(c.last_transition_time, t2);
        assert_eq!(c.reason, "NodeEvicted");
        assert!(conditions.get(ConditionType::Error).is_none());
    }

    #[test]
    fn test_serializes_as_list() {
        let mut conditions = Conditions::new();
        conditions.set(ConditionType::Error, ConditionStatus::True, "", "boom");

        let json = serde_json::to_value(&conditions).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["type"], "Error");
        assert_eq!(json[0]["status"], "True");
        assert_eq!(json[0]["message"], "boom");
    }
}
