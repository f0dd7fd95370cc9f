//! Deadline reminders: the reminder lane consumer.

use std::collections::HashSet;
use std::sync::Arc;

use classrep_core::{AssessmentRepository, AssessmentStatus, SubmissionRepository, UserId};
use classrep_infra::jobs::{HandlerError, Job, JobHandler};
use tracing::{info, instrument};

use crate::messages;
use crate::notifier::Notifier;
use crate::payloads::ReminderJob;

/// Notifies enrolled students that have not submitted yet.
pub struct ReminderHandler {
    assessments: Arc<dyn AssessmentRepository>,
    submissions: Arc<dyn SubmissionRepository>,
    notifier: Notifier,
}

impl ReminderHandler {
    pub fn new(
        assessments: Arc<dyn AssessmentRepository>,
        submissions: Arc<dyn SubmissionRepository>,
        notifier: Notifier,
    ) -> Self {
        Self {
            assessments,
            submissions,
            notifier,
        }
    }

    /// Returns how many students were reminded.
    #[instrument(skip(self, reminder), fields(assessment_id = %reminder.assessment_id))]
    pub async fn remind(&self, reminder: &ReminderJob) -> Result<usize, HandlerError> {
        let Some(assessment) = self.assessments.get_assessment(reminder.assessment_id).await? else {
            info!("assessment no longer exists; reminder dropped");
            return Ok(0);
        };
        if assessment.deleted || assessment.status != AssessmentStatus::Active {
            info!(status = %assessment.status, deleted = assessment.deleted, "assessment not open; reminder dropped");
            return Ok(0);
        }
        if assessment.deadline != reminder.deadline {
            info!(deadline = %assessment.deadline, "deadline moved; reminder dropped");
            return Ok(0);
        }

        let submitted: HashSet<UserId> = self
            .submissions
            .submitted_students(assessment.id)
            .await?
            .into_iter()
            .collect();
        let pending: Vec<UserId> = self
            .submissions
            .active_enrollments(assessment.batch_id)
            .await?
            .into_iter()
            .filter(|s| !submitted.contains(s))
            .collect();

        if pending.is_empty() {
            info!("every enrolled student has submitted; no reminder needed");
            return Ok(0);
        }
        let count = pending.len();
        self.notifier
            .enqueue(&messages::deadline_reminder(&assessment, pending))
            .await?;
        info!(students = count, "deadline reminder enqueued");
        Ok(count)
    }
}

#[async_trait::async_trait]
impl JobHandler for ReminderHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let reminder: ReminderJob = serde_json::from_value(job.payload.clone())?;
        self.remind(&reminder).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use classrep_core::{Assessment, AssessmentId, Audience, BatchId, NotificationJob};
    use classrep_infra::InMemoryBackend;
    use classrep_infra::jobs::{InMemoryJobStore, JobQueue, QueueName};

    use super::*;
    use crate::transition::reminder_event_key;

    fn setup() -> (Arc<InMemoryBackend>, JobQueue, ReminderHandler, Assessment) {
        let backend = InMemoryBackend::arc();
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let handler = ReminderHandler::new(backend.clone(), backend.clone(), Notifier::new(queue.clone()));
        let now = Utc::now();
        let assessment = Assessment {
            id: AssessmentId::new(),
            coordinator_id: UserId::new(),
            batch_id: BatchId::new(),
            title: "Lab report".into(),
            start_time: now - Duration::hours(1),
            deadline: now + Duration::hours(1),
            status: AssessmentStatus::Active,
            deleted: false,
        };
        backend.insert_assessment(assessment.clone()).unwrap();
        (backend, queue, handler, assessment)
    }

    #[tokio::test]
    async fn reminds_only_students_without_submission() {
        let (backend, queue, handler, a) = setup();
        let (done, late) = (UserId::new(), UserId::new());
        backend.enroll(a.batch_id, done).unwrap();
        backend.enroll(a.batch_id, late).unwrap();
        backend.submit(a.id, done).unwrap();

        let reminded = handler
            .remind(&ReminderJob {
                assessment_id: a.id,
                deadline: a.deadline,
            })
            .await
            .unwrap();

        assert_eq!(reminded, 1);
        let job = queue
            .live_job(QueueName::Notification, &reminder_event_key(a.id, a.deadline))
            .await
            .unwrap()
            .unwrap();
        let payload: NotificationJob = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload.audience, Audience::Users { user_ids: vec![late] });
    }

    #[tokio::test]
    async fn stale_deadline_is_ignored() {
        let (backend, queue, handler, a) = setup();
        backend.enroll(a.batch_id, UserId::new()).unwrap();

        let reminded = handler
            .remind(&ReminderJob {
                assessment_id: a.id,
                deadline: a.deadline - Duration::minutes(30),
            })
            .await
            .unwrap();

        assert_eq!(reminded, 0);
        assert_eq!(queue.stats(QueueName::Notification).await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn moved_deadline_reminds_under_a_new_key() {
        let (backend, queue, handler, mut a) = setup();
        backend.enroll(a.batch_id, UserId::new()).unwrap();
        let first = a.deadline;
        handler
            .remind(&ReminderJob {
                assessment_id: a.id,
                deadline: first,
            })
            .await
            .unwrap();

        a.deadline = first + Duration::days(1);
        backend.insert_assessment(a.clone()).unwrap();
        let reminded = handler
            .remind(&ReminderJob {
                assessment_id: a.id,
                deadline: a.deadline,
            })
            .await
            .unwrap();

        assert_eq!(reminded, 1);
        assert_ne!(reminder_event_key(a.id, first), reminder_event_key(a.id, a.deadline));
        for deadline in [first, a.deadline] {
            let job = queue
                .live_job(QueueName::Notification, &reminder_event_key(a.id, deadline))
                .await
                .unwrap()
                .unwrap();
            let payload: NotificationJob = serde_json::from_value(job.payload).unwrap();
            assert_eq!(payload.event_key, Some(reminder_event_key(a.id, deadline)));
        }
    }
}
