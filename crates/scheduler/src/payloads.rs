//! Job payloads, one shape per lane.
//!
//! The notification lane carries [`classrep_core::NotificationJob`] and the
//! email lane [`classrep_infra::EmailJob`].

use chrono::{DateTime, Utc};
use classrep_core::{AssessmentId, AssessmentStatus, ClassId, ClassStatus, EntityKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status-update lane payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum StatusUpdateJob {
    Class {
        class_id: ClassId,
        new_status: ClassStatus,
        scheduled_for: DateTime<Utc>,
    },
    Assessment {
        assessment_id: AssessmentId,
        new_status: AssessmentStatus,
        scheduled_for: DateTime<Utc>,
    },
}

impl StatusUpdateJob {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            StatusUpdateJob::Class { .. } => EntityKind::Class,
            StatusUpdateJob::Assessment { .. } => EntityKind::Assessment,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            StatusUpdateJob::Class { class_id, .. } => *class_id.as_uuid(),
            StatusUpdateJob::Assessment { assessment_id, .. } => *assessment_id.as_uuid(),
        }
    }

    pub fn scheduled_for(&self) -> DateTime<Utc> {
        match self {
            StatusUpdateJob::Class { scheduled_for, .. }
            | StatusUpdateJob::Assessment { scheduled_for, .. } => *scheduled_for,
        }
    }
}

/// Reminder lane payload. `deadline` is the deadline the reminder was
/// computed from; a reminder for a since-moved deadline is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderJob {
    pub assessment_id: AssessmentId,
    pub deadline: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_update_is_tagged_by_entity() {
        let job = StatusUpdateJob::Class {
            class_id: ClassId::new(),
            new_status: ClassStatus::Ongoing,
            scheduled_for: Utc::now(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["entity"], "class");
        assert_eq!(value["new_status"], "ONGOING");
    }

    #[test]
    fn untagged_payload_is_rejected() {
        let raw = serde_json::json!({ "class_id": uuid::Uuid::now_v7(), "new_status": "ONGOING" });
        assert!(serde_json::from_value::<StatusUpdateJob>(raw).is_err());
    }
}
