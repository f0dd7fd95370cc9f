//! Time-driven transitions derived from an entity's schedule.

use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use classrep_core::{AssessmentId, AssessmentStatus, ClassId, ClassStatus, EntityKind, Lifecycle};
use uuid::Uuid;

use crate::payloads::StatusUpdateJob;

/// Dedupe key suffix of the deadline reminder.
pub const REMINDER_SUFFIX: &str = "reminder";

/// Every key suffix an entity may own on the status-update and reminder lanes.
pub const OWNED_SUFFIXES: [&str; 4] = ["ongoing", "completed", "active", REMINDER_SUFFIX];

/// `{entity_id}-{suffix}`.
pub fn transition_key(entity_id: impl Display, suffix: &str) -> String {
    format!("{entity_id}-{suffix}")
}

/// Event key of a deadline reminder: `{assessment_id}-reminder-{deadline_ms}`.
/// A moved deadline yields a new key, so the rescheduled reminder is not
/// swallowed by the row written for the old one.
pub fn reminder_event_key(assessment_id: AssessmentId, deadline: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        transition_key(assessment_id, REMINDER_SUFFIX),
        deadline.timestamp_millis()
    )
}

/// One status change owed to an entity at `trigger_at`. Derived from the
/// entity's timestamps, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTransition {
    pub entity_id: Uuid,
    pub entity_kind: EntityKind,
    pub from_status: &'static str,
    pub to_status: &'static str,
    pub trigger_at: DateTime<Utc>,
    pub dedupe_key: String,
    pub payload: StatusUpdateJob,
}

impl ScheduledTransition {
    pub fn class(id: ClassId, from: ClassStatus, to: ClassStatus, at: DateTime<Utc>) -> Self {
        Self {
            entity_id: *id.as_uuid(),
            entity_kind: EntityKind::Class,
            from_status: from.as_str(),
            to_status: to.as_str(),
            trigger_at: at,
            dedupe_key: transition_key(id, &to.key_suffix()),
            payload: StatusUpdateJob::Class {
                class_id: id,
                new_status: to,
                scheduled_for: at,
            },
        }
    }

    pub fn assessment(
        id: AssessmentId,
        from: AssessmentStatus,
        to: AssessmentStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: *id.as_uuid(),
            entity_kind: EntityKind::Assessment,
            from_status: from.as_str(),
            to_status: to.as_str(),
            trigger_at: at,
            dedupe_key: transition_key(id, &to.key_suffix()),
            payload: StatusUpdateJob::Assessment {
                assessment_id: id,
                new_status: to,
                scheduled_for: at,
            },
        }
    }

    /// Delay until the trigger, or `None` when it is not in the future.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        delay_until(self.trigger_at, now)
    }
}

pub(crate) fn delay_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (at - now).to_std().ok().filter(|d| !d.is_zero())
}

/// `SCHEDULED → ONGOING` at `start`, `ONGOING → COMPLETED` at `end`.
pub fn class_transitions(
    id: ClassId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> [ScheduledTransition; 2] {
    [
        ScheduledTransition::class(id, ClassStatus::Scheduled, ClassStatus::Ongoing, start),
        ScheduledTransition::class(id, ClassStatus::Ongoing, ClassStatus::Completed, end),
    ]
}

/// `SCHEDULED → ACTIVE` at `start`, `ACTIVE → COMPLETED` at `deadline`.
pub fn assessment_transitions(
    id: AssessmentId,
    start: DateTime<Utc>,
    deadline: DateTime<Utc>,
) -> [ScheduledTransition; 2] {
    [
        ScheduledTransition::assessment(
            id,
            AssessmentStatus::Scheduled,
            AssessmentStatus::Active,
            start,
        ),
        ScheduledTransition::assessment(
            id,
            AssessmentStatus::Active,
            AssessmentStatus::Completed,
            deadline,
        ),
    ]
}

/// When the deadline reminder should fire: `deadline - lead`, provided that
/// is still ahead of `now` and after `start`.
pub fn reminder_at(
    start: DateTime<Utc>,
    deadline: DateTime<Utc>,
    lead: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let lead = chrono::Duration::from_std(lead).ok()?;
    let at = deadline.checked_sub_signed(lead)?;
    (at > now && at > start).then_some(at)
}
