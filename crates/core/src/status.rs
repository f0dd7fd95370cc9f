//! Status state machines for time-bounded entities.
//!
//! Classes move `SCHEDULED → ONGOING → COMPLETED`, with `CANCELLED` reachable
//! from `SCHEDULED` only. Assessments move `SCHEDULED → ACTIVE → COMPLETED`.
//! Forward progress is time-driven; every status carries a progress rank so a
//! late or duplicated transition can be recognised as "already applied".

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Common behaviour of the entity status enums.
pub trait Lifecycle: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Position along the time-driven progression.
    fn rank(self) -> u8;

    /// Terminal states that suppress any pending time-driven transition.
    fn suppresses_schedule(self) -> bool;

    /// Canonical upper-case wire/database form.
    fn as_str(self) -> &'static str;

    /// Lower-case form used as the dedupe key suffix.
    fn key_suffix(self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    /// Decide whether moving from `current` to `target` should be applied.
    fn decide(current: Self, target: Self, deleted: bool) -> TransitionDecision {
        if deleted {
            TransitionDecision::SkipDeleted
        } else if current.suppresses_schedule() {
            TransitionDecision::SkipTerminal
        } else if current == target {
            TransitionDecision::AlreadyApplied
        } else if current.rank() > target.rank() {
            TransitionDecision::AlreadyAhead
        } else {
            TransitionDecision::Apply
        }
    }
}

/// Outcome of comparing an entity's current status with a scheduled target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransitionDecision {
    /// The target is ahead of the current status; persist it.
    Apply,
    /// The entity is soft-deleted.
    SkipDeleted,
    /// The entity sits in a terminal state that cancels its schedule.
    SkipTerminal,
    /// The entity already has exactly the target status.
    AlreadyApplied,
    /// The entity is already past the target status.
    AlreadyAhead,
}

impl TransitionDecision {
    pub fn should_apply(self) -> bool {
        matches!(self, TransitionDecision::Apply)
    }

    pub fn reason(self) -> &'static str {
        match self {
            TransitionDecision::Apply => "apply",
            TransitionDecision::SkipDeleted => "entity deleted",
            TransitionDecision::SkipTerminal => "entity in terminal state",
            TransitionDecision::AlreadyApplied => "status already applied",
            TransitionDecision::AlreadyAhead => "status already ahead of target",
        }
    }
}

/// Class status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassStatus {
    Scheduled,
    Ongoing,
    Completed,
    Cancelled,
}

impl Lifecycle for ClassStatus {
    fn rank(self) -> u8 {
        match self {
            ClassStatus::Scheduled => 0,
            ClassStatus::Ongoing => 1,
            ClassStatus::Completed => 2,
            ClassStatus::Cancelled => 3,
        }
    }

    fn suppresses_schedule(self) -> bool {
        matches!(self, ClassStatus::Cancelled)
    }

    fn as_str(self) -> &'static str {
        match self {
            ClassStatus::Scheduled => "SCHEDULED",
            ClassStatus::Ongoing => "ONGOING",
            ClassStatus::Completed => "COMPLETED",
            ClassStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Assessment status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssessmentStatus {
    Scheduled,
    Active,
    Completed,
}

impl Lifecycle for AssessmentStatus {
    fn rank(self) -> u8 {
        match self {
            AssessmentStatus::Scheduled => 0,
            AssessmentStatus::Active => 1,
            AssessmentStatus::Completed => 2,
        }
    }

    fn suppresses_schedule(self) -> bool {
        false
    }

    fn as_str(self) -> &'static str {
        match self {
            AssessmentStatus::Scheduled => "SCHEDULED",
            AssessmentStatus::Active => "ACTIVE",
            AssessmentStatus::Completed => "COMPLETED",
        }
    }
}

macro_rules! impl_status_text {
    ($t:ty, $name:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v: &$t| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| DomainError::invalid_id(format!("{}: {}", $name, s)))
            }
        }
    };
}

impl_status_text!(
    ClassStatus,
    "ClassStatus",
    [
        ClassStatus::Scheduled,
        ClassStatus::Ongoing,
        ClassStatus::Completed,
        ClassStatus::Cancelled,
    ]
);
impl_status_text!(
    AssessmentStatus,
    "AssessmentStatus",
    [
        AssessmentStatus::Scheduled,
        AssessmentStatus::Active,
        AssessmentStatus::Completed,
    ]
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transition_is_applied() {
        assert_eq!(
            ClassStatus::decide(ClassStatus::Scheduled, ClassStatus::Ongoing, false),
            TransitionDecision::Apply
        );
        assert_eq!(
            ClassStatus::decide(ClassStatus::Scheduled, ClassStatus::Completed, false),
            TransitionDecision::Apply
        );
    }

    #[test]
    fn duplicate_delivery_is_already_applied() {
        assert_eq!(
            ClassStatus::decide(ClassStatus::Ongoing, ClassStatus::Ongoing, false),
            TransitionDecision::AlreadyApplied
        );
    }

    #[test]
    fn reordered_delivery_is_already_ahead() {
        assert_eq!(
            ClassStatus::decide(ClassStatus::Completed, ClassStatus::Ongoing, false),
            TransitionDecision::AlreadyAhead
        );
        assert_eq!(
            AssessmentStatus::decide(AssessmentStatus::Completed, AssessmentStatus::Active, false),
            TransitionDecision::AlreadyAhead
        );
    }

    #[test]
    fn cancelled_class_suppresses_everything() {
        for target in [ClassStatus::Ongoing, ClassStatus::Completed] {
            assert_eq!(
                ClassStatus::decide(ClassStatus::Cancelled, target, false),
                TransitionDecision::SkipTerminal
            );
        }
    }

    #[test]
    fn deletion_wins_over_everything_else() {
        assert_eq!(
            AssessmentStatus::decide(AssessmentStatus::Scheduled, AssessmentStatus::Active, true),
            TransitionDecision::SkipDeleted
        );
    }

    #[test]
    fn status_text_round_trips_case_insensitively() {
        assert_eq!("ongoing".parse::<ClassStatus>().unwrap(), ClassStatus::Ongoing);
        assert_eq!("ACTIVE".parse::<AssessmentStatus>().unwrap(), AssessmentStatus::Active);
        assert!("ACTIVE".parse::<ClassStatus>().is_err());
        assert_eq!(ClassStatus::Completed.key_suffix(), "completed");
    }

    #[test]
    fn serde_uses_upper_case() {
        let json = serde_json::to_string(&ClassStatus::Ongoing).unwrap();
        assert_eq!(json, "\"ONGOING\"");
    }
}
