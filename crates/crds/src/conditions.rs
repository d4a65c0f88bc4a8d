//! Readiness conditions tracked on an ImageBuild.
//!
//! Each condition type has at most one record. Records are created as
//! `Unknown` during initialization and are never removed afterwards.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason recorded on freshly initialized conditions
pub const REASON_INITIALIZING: &str = "Initializing";

/// Condition types tracked on an ImageBuild
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    /// Base image pulled and a working container created
    BaseImageReady,
    /// Builder Job created and finished successfully
    BuilderJobReady,
    /// Provisioner ran to completion (or none was requested)
    ProvisionerReady,
    /// Artifacts written to the output destination
    OutputReady,
    /// Artifacts published (or no publish target was requested)
    PublishReady,
}

impl ConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionType::BaseImageReady => "BaseImageReady",
            ConditionType::BuilderJobReady => "BuilderJobReady",
            ConditionType::ProvisionerReady => "ProvisionerReady",
            ConditionType::OutputReady => "OutputReady",
            ConditionType::PublishReady => "PublishReady",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full condition set every ImageBuild is initialized with.
pub const IMAGE_BUILD_CONDITION_TYPES: [ConditionType; 5] = [
    ConditionType::BaseImageReady,
    ConditionType::BuilderJobReady,
    ConditionType::ProvisionerReady,
    ConditionType::OutputReady,
    ConditionType::PublishReady,
];

/// Tri-state condition value
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A single named readiness observation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Current value
    pub status: ConditionStatus,

    /// Machine-readable CamelCase reason for the last transition
    pub reason: String,

    /// Human-readable detail
    #[serde(default)]
    pub message: String,

    /// Last time `status` changed
    pub last_transition_time: DateTime<Utc>,
}

/// Sets every condition in `types` that is not yet present to `Unknown`.
///
/// Existing records are left untouched. The set of types is a parameter so
/// callers (and tests) decide which conditions a resource tracks.
pub fn initialize_conditions(
    conditions: &mut Vec<Condition>,
    types: &[ConditionType],
    now: DateTime<Utc>,
) {
    for type_ in types {
        if find_condition(conditions, *type_).is_none() {
            conditions.push(Condition {
                type_: *type_,
                status: ConditionStatus::Unknown,
                reason: REASON_INITIALIZING.to_string(),
                message: "Unknown".to_string(),
                last_transition_time: now,
            });
        }
    }
}

/// Upserts a condition record.
///
/// `lastTransitionTime` only moves when the status value changes, so
/// re-asserting the same observation leaves the record byte-identical.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message;
        }
        None => conditions.push(Condition {
            type_,
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
        }),
    }
}

/// Looks up the record for a condition type.
pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_initialize_sets_all_unknown() {
        let mut conditions = Vec::new();
        initialize_conditions(&mut conditions, &IMAGE_BUILD_CONDITION_TYPES, t(1));

        assert_eq!(conditions.len(), 5);
        assert!(conditions.iter().all(|c| c.status == ConditionStatus::Unknown
            && c.reason == REASON_INITIALIZING));
    }

    #[test]
    fn test_initialize_preserves_existing_records() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            ConditionType::OutputReady,
            ConditionStatus::True,
            "Archived",
            "done",
            t(1),
        );
        initialize_conditions(&mut conditions, &IMAGE_BUILD_CONDITION_TYPES, t(2));

        let output = find_condition(&conditions, ConditionType::OutputReady).unwrap();
        assert_eq!(output.status, ConditionStatus::True);
        assert_eq!(output.last_transition_time, t(1));
        assert_eq!(conditions.len(), 5);
    }

    #[test]
    fn test_initialize_with_custom_type_set() {
        let mut conditions = Vec::new();
        initialize_conditions(&mut conditions, &[ConditionType::PublishReady], t(1));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, ConditionType::PublishReady);
    }

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, ConditionType::BuilderJobReady, ConditionStatus::False, "JobRunning", "", t(1));
        set_condition(&mut conditions, ConditionType::BuilderJobReady, ConditionStatus::False, "JobRunning", "", t(2));
        assert_eq!(conditions[0].last_transition_time, t(1));

        set_condition(&mut conditions, ConditionType::BuilderJobReady, ConditionStatus::True, "JobSucceeded", "", t(3));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t(3));
        assert_eq!(conditions[0].reason, "JobSucceeded");
    }

    #[test]
    fn test_condition_serializes_type_key() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, ConditionType::BaseImageReady, ConditionStatus::True, "Pulled", "", t(0));
        let value = serde_json::to_value(&conditions[0]).unwrap();
        assert_eq!(value["type"], "BaseImageReady");
        assert_eq!(value["status"], "True");
        assert_eq!(value["lastTransitionTime"], "1970-01-01T00:00:00Z");
    }
}
