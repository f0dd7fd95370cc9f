//! Notification producer: validates and enqueues fan-out jobs.

use classrep_core::{NotificationJob, NotificationRequest};
use classrep_infra::jobs::{EnqueueOptions, JobHandle, JobQueue, QueueName};
use tracing::instrument;

use crate::error::SchedulingError;

/// Enqueues [`NotificationJob`]s on the notification lane.
///
/// Jobs with an `event_key` use it as their queue dedupe key, so re-driving
/// the same event while its fan-out is still pending does not double it up.
#[derive(Debug, Clone)]
pub struct Notifier {
    queue: JobQueue,
}

impl Notifier {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Validate a loose request (exactly one audience selector) and enqueue it.
    pub async fn enqueue_request(
        &self,
        request: NotificationRequest,
    ) -> Result<JobHandle, SchedulingError> {
        let job = NotificationJob::try_from(request)?;
        self.enqueue(&job).await
    }

    #[instrument(skip(self, job), fields(kind = job.kind.as_str(), event_key = job.event_key.as_deref().unwrap_or("")), err)]
    pub async fn enqueue(&self, job: &NotificationJob) -> Result<JobHandle, SchedulingError> {
        job.validate()?;
        let mut options = EnqueueOptions::new();
        if let Some(key) = &job.event_key {
            options = options.dedupe_key(key.clone());
        }
        Ok(self.queue.enqueue(QueueName::Notification, job, options).await?)
    }
}

#[cfg(test)]
mod tests {
    use classrep_core::UserId;
    use classrep_infra::jobs::InMemoryJobStore;

    use super::*;

    #[tokio::test]
    async fn conflicting_selectors_never_reach_the_queue() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let notifier = Notifier::new(queue.clone());

        let err = notifier
            .enqueue_request(NotificationRequest {
                title: "Notice".into(),
                message: "Exam hall changed".into(),
                explicit_user_ids: Some(vec![UserId::new()]),
                coordinator_id: Some(UserId::new()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulingError::Invalid(_)));
        assert!(err.to_string().contains("mutually exclusive"));
        assert_eq!(queue.stats(QueueName::Notification).await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn valid_request_is_enqueued() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let notifier = Notifier::new(queue.clone());

        notifier
            .enqueue_request(NotificationRequest {
                title: "Notice".into(),
                message: "Exam hall changed".into(),
                coordinator_id: Some(UserId::new()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(queue.stats(QueueName::Notification).await.unwrap().waiting, 1);
    }
}
