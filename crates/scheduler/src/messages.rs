//! In-app notification text for time-driven events.

use chrono::{DateTime, Utc};
use classrep_core::{
    Assessment, AssessmentStatus, Audience, ClassSession, ClassStatus, Lifecycle, NotificationJob,
    NotificationType, UserId,
};

use crate::transition::{reminder_event_key, transition_key};

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Notification for the class's students after a status change. `None` for
/// statuses that do not notify.
pub fn class_status_changed(class: &ClassSession, status: ClassStatus) -> Option<NotificationJob> {
    let (title, message) = match status {
        ClassStatus::Ongoing => (
            "Class started",
            format!("{} has started and runs until {}.", class.subject, format_time(class.end_time)),
        ),
        ClassStatus::Completed => ("Class ended", format!("{} has ended.", class.subject)),
        ClassStatus::Scheduled | ClassStatus::Cancelled => return None,
    };
    Some(
        NotificationJob::new(
            NotificationType::Class,
            title,
            message,
            Audience::Coordinator {
                coordinator_id: class.coordinator_id,
            },
        )
        .related_to(class.id)
        .with_event_key(transition_key(class.id, &status.key_suffix())),
    )
}

pub fn assessment_status_changed(
    assessment: &Assessment,
    status: AssessmentStatus,
) -> Option<NotificationJob> {
    let (title, message) = match status {
        AssessmentStatus::Active => (
            "Assessment is open",
            format!(
                "{} is now open. Submit before {}.",
                assessment.title,
                format_time(assessment.deadline)
            ),
        ),
        AssessmentStatus::Completed => (
            "Assessment closed",
            format!("The deadline for {} has passed.", assessment.title),
        ),
        AssessmentStatus::Scheduled => return None,
    };
    Some(
        NotificationJob::new(
            NotificationType::Assessment,
            title,
            message,
            Audience::Coordinator {
                coordinator_id: assessment.coordinator_id,
            },
        )
        .related_to(assessment.id)
        .with_event_key(transition_key(assessment.id, &status.key_suffix())),
    )
}

/// Reminder addressed to the students that have not submitted yet.
pub fn deadline_reminder(assessment: &Assessment, students: Vec<UserId>) -> NotificationJob {
    NotificationJob::new(
        NotificationType::Assessment,
        "Deadline approaching",
        format!(
            "{} is due at {} and you have not submitted yet.",
            assessment.title,
            format_time(assessment.deadline)
        ),
        Audience::Users { user_ids: students },
    )
    .related_to(assessment.id)
    .with_event_key(reminder_event_key(assessment.id, assessment.deadline))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use classrep_core::{BatchId, ClassId};

    use super::*;

    fn class() -> ClassSession {
        let start = Utc::now();
        ClassSession {
            id: ClassId::new(),
            coordinator_id: UserId::new(),
            batch_id: Some(BatchId::new()),
            subject: "Compilers".into(),
            start_time: start,
            end_time: start + Duration::hours(1),
            status: ClassStatus::Scheduled,
            deleted: false,
        }
    }

    #[test]
    fn class_notifications_carry_transition_key() {
        let c = class();
        let job = class_status_changed(&c, ClassStatus::Ongoing).unwrap();
        assert_eq!(job.event_key, Some(format!("{}-ongoing", c.id)));
        assert_eq!(job.related_entity_id, Some(*c.id.as_uuid()));
        assert!(job.message.contains("Compilers"));
        assert!(matches!(job.audience, Audience::Coordinator { coordinator_id } if coordinator_id == c.coordinator_id));
    }

    #[test]
    fn cancellation_does_not_notify() {
        assert!(class_status_changed(&class(), ClassStatus::Cancelled).is_none());
    }
}
