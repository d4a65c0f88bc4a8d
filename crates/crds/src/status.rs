//! ImageBuild status and lifecycle phase

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::conditions::{Condition, ConditionType, find_condition};

/// High-level build state, a projection of the conditions.
///
/// Serializes as PascalCase ("Pending", "Building", ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has been started yet
    #[default]
    Pending,
    /// The builder Job is running
    Building,
    /// The build finished and artifacts are being published
    Publishing,
    /// Build and publishing completed
    Succeeded,
    /// The build or a publishing step failed. Terminal.
    Failed,
}

impl Phase {
    /// Succeeded and Failed are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::Building => 1,
            Phase::Publishing => 2,
            Phase::Succeeded | Phase::Failed => 3,
        }
    }

    /// Returns the phase after observing `next`.
    ///
    /// Terminal phases stick, Failed is reachable from every non-terminal
    /// phase, and otherwise the phase only moves forward.
    #[must_use]
    pub fn advance(self, next: Phase) -> Phase {
        if self.is_terminal() {
            return self;
        }
        if next == Phase::Failed || next.rank() >= self.rank() {
            next
        } else {
            self
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Building => "Building",
            Phase::Publishing => "Publishing",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// ImageBuildStatus defines the observed state of an ImageBuild
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildStatus {
    /// High-level summary of the build state
    #[serde(default)]
    pub phase: Phase,

    /// Latest readiness observations, one per condition type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the builder Job started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the builder Job finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Name of the Job executing the build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_job_name: Option<String>,

    /// Final location of the built artifact
    #[serde(default, rename = "outputURL", skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,

    /// Generation of the spec the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ImageBuildStatus {
    /// Looks up a condition by type.
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        find_condition(&self.conditions, type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Phase; 5] = [
        Phase::Pending,
        Phase::Building,
        Phase::Publishing,
        Phase::Succeeded,
        Phase::Failed,
    ];

    #[test]
    fn test_phase_advances_forward() {
        assert_eq!(Phase::Pending.advance(Phase::Building), Phase::Building);
        assert_eq!(Phase::Building.advance(Phase::Publishing), Phase::Publishing);
        assert_eq!(Phase::Publishing.advance(Phase::Succeeded), Phase::Succeeded);
    }

    #[test]
    fn test_phase_never_regresses() {
        assert_eq!(Phase::Publishing.advance(Phase::Building), Phase::Publishing);
        assert_eq!(Phase::Building.advance(Phase::Pending), Phase::Building);
    }

    #[test]
    fn test_terminal_phases_stick() {
        for next in ALL {
            assert_eq!(Phase::Succeeded.advance(next), Phase::Succeeded);
            assert_eq!(Phase::Failed.advance(next), Phase::Failed);
        }
    }

    #[test]
    fn test_failed_reachable_from_non_terminal() {
        for current in [Phase::Pending, Phase::Building, Phase::Publishing] {
            assert_eq!(current.advance(Phase::Failed), Phase::Failed);
        }
    }

    #[test]
    fn test_status_wire_names() {
        let status = ImageBuildStatus {
            phase: Phase::Building,
            builder_job_name: Some("imgbldr-demo".to_string()),
            output_url: Some("pvc://out/demo.tar.gz".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "Building");
        assert_eq!(value["builderJobName"], "imgbldr-demo");
        assert_eq!(value["outputURL"], "pvc://out/demo.tar.gz");
        assert!(value.get("conditions").is_none());
    }
}
