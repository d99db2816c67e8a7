//! Lifecycle status of a work unit.
//!
//! ```text
//! Pending --submit--> Submitted --> Validating|Scheduled|InProgress|Stopping
//!                                   --> Completed|PartiallyCompleted|Failed|Stopped|Expired
//! ```
//!
//! Only the admission controller moves a record out of `Pending`; every later status is
//! reported by the external service.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a [crate::WorkUnitRecord], spelled the way the external service reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkUnitStatus {
    Pending,
    Submitted,
    Validating,
    Scheduled,
    InProgress,
    Stopping,
    Completed,
    PartiallyCompleted,
    Failed,
    Stopped,
    Expired,
}

/// A status string the external service sent that is not part of the lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown work unit status: {0}")]
pub struct UnknownStatus(pub String);

impl WorkUnitStatus {
    pub const ALL: [WorkUnitStatus; 11] = [
        WorkUnitStatus::Pending,
        WorkUnitStatus::Submitted,
        WorkUnitStatus::Validating,
        WorkUnitStatus::Scheduled,
        WorkUnitStatus::InProgress,
        WorkUnitStatus::Stopping,
        WorkUnitStatus::Completed,
        WorkUnitStatus::PartiallyCompleted,
        WorkUnitStatus::Failed,
        WorkUnitStatus::Stopped,
        WorkUnitStatus::Expired,
    ];

    /// Statuses the external service counts as occupying a concurrency slot.
    pub const IN_FLIGHT: [WorkUnitStatus; 5] = [
        WorkUnitStatus::Submitted,
        WorkUnitStatus::Validating,
        WorkUnitStatus::Scheduled,
        WorkUnitStatus::InProgress,
        WorkUnitStatus::Stopping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkUnitStatus::Pending => "Pending",
            WorkUnitStatus::Submitted => "Submitted",
            WorkUnitStatus::Validating => "Validating",
            WorkUnitStatus::Scheduled => "Scheduled",
            WorkUnitStatus::InProgress => "InProgress",
            WorkUnitStatus::Stopping => "Stopping",
            WorkUnitStatus::Completed => "Completed",
            WorkUnitStatus::PartiallyCompleted => "PartiallyCompleted",
            WorkUnitStatus::Failed => "Failed",
            WorkUnitStatus::Stopped => "Stopped",
            WorkUnitStatus::Expired => "Expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkUnitStatus::Completed
                | WorkUnitStatus::PartiallyCompleted
                | WorkUnitStatus::Failed
                | WorkUnitStatus::Stopped
                | WorkUnitStatus::Expired
        )
    }

    /// Terminal statuses that produce an output artifact.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            WorkUnitStatus::Completed | WorkUnitStatus::PartiallyCompleted
        )
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    /// Position in the lifecycle. All terminal statuses share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            WorkUnitStatus::Pending => 0,
            WorkUnitStatus::Submitted => 1,
            WorkUnitStatus::Validating => 2,
            WorkUnitStatus::Scheduled => 3,
            WorkUnitStatus::InProgress => 4,
            WorkUnitStatus::Stopping => 5,
            _ => 6,
        }
    }

    /// Whether a record currently in `self` may move to `next`.
    ///
    /// Re-applying the current status is allowed (idempotent delivery). Terminal
    /// statuses accept nothing else, and no transition moves backwards in the lifecycle.
    pub fn can_transition_to(&self, next: WorkUnitStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for WorkUnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkUnitStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        WorkUnitStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_every_status() {
        for status in WorkUnitStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkUnitStatus>(), Ok(status));
        }
    }

    #[test]
    fn parse_rejects_unknown_spelling() {
        let err = "SUMMITTED".parse::<WorkUnitStatus>().unwrap_err();
        assert_eq!(err, UnknownStatus("SUMMITTED".into()));
    }

    #[test]
    fn serde_uses_external_spelling() {
        let json = serde_json::to_string(&WorkUnitStatus::PartiallyCompleted).unwrap();
        assert_eq!(json, "\"PartiallyCompleted\"");
        let back: WorkUnitStatus = serde_json::from_str("\"InProgress\"").unwrap();
        assert_eq!(back, WorkUnitStatus::InProgress);
    }

    #[test]
    fn terminal_and_success_sets() {
        let terminal: Vec<_> = WorkUnitStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 5);
        assert!(WorkUnitStatus::Completed.is_success());
        assert!(WorkUnitStatus::PartiallyCompleted.is_success());
        assert!(!WorkUnitStatus::Failed.is_success());
        assert!(!WorkUnitStatus::Pending.is_in_flight());
        assert!(WorkUnitStatus::Stopping.is_in_flight());
    }

    #[test]
    fn transitions_never_leave_terminal() {
        assert!(WorkUnitStatus::Completed.can_transition_to(WorkUnitStatus::Completed));
        assert!(!WorkUnitStatus::Completed.can_transition_to(WorkUnitStatus::Failed));
        assert!(!WorkUnitStatus::Expired.can_transition_to(WorkUnitStatus::InProgress));
    }

    #[test]
    fn transitions_are_monotonic() {
        assert!(WorkUnitStatus::Submitted.can_transition_to(WorkUnitStatus::InProgress));
        assert!(WorkUnitStatus::Scheduled.can_transition_to(WorkUnitStatus::Failed));
        assert!(!WorkUnitStatus::InProgress.can_transition_to(WorkUnitStatus::Validating));
        assert!(!WorkUnitStatus::Stopping.can_transition_to(WorkUnitStatus::Submitted));
    }
}
