//! Notification fan-out: the notification lane consumer.

use std::sync::Arc;
use std::time::Duration;

use classrep_core::{
    Audience, AudienceDirectory, NewNotification, Notification, NotificationJob,
    NotificationRepository, Recipient, RepositoryError,
};
use classrep_events::RealtimeChannel;
use classrep_infra::jobs::{EnqueueOptions, HandlerError, Job, JobHandler, JobQueue, QueueName};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::templates;

/// Real-time event name for a newly stored notification.
pub const NOTIFICATION_EVENT: &str = "notification";

/// Per-job delivery counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub recipients: usize,
    pub inserted: usize,
    /// Recipients that already had the row from an earlier attempt.
    pub duplicates: usize,
    /// Emails queued, including re-queues for duplicate rows.
    pub emails_enqueued: usize,
    pub failures: Vec<String>,
}

enum Delivery {
    Inserted { email: bool },
    Duplicate { email: bool },
}

/// Resolves the audience and delivers one row per recipient, with a
/// real-time push for rows that were newly inserted and an email job for
/// every recipient with a usable address.
///
/// Recipients are processed concurrently up to `fan_out`. Failures are
/// collected; if any recipient failed the job fails and is retried. The
/// retry does not insert rows twice, but it queues the email again, so email
/// delivery is at-least-once.
pub struct NotificationDispatcher {
    audience: Arc<dyn AudienceDirectory>,
    notifications: Arc<dyn NotificationRepository>,
    realtime: Arc<dyn RealtimeChannel>,
    queue: JobQueue,
    fan_out: usize,
    external_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        audience: Arc<dyn AudienceDirectory>,
        notifications: Arc<dyn NotificationRepository>,
        realtime: Arc<dyn RealtimeChannel>,
        queue: JobQueue,
    ) -> Self {
        Self {
            audience,
            notifications,
            realtime,
            queue,
            fan_out: 10,
            external_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    /// Upper bound on each real-time emit.
    pub fn with_external_timeout(mut self, timeout: Duration) -> Self {
        self.external_timeout = timeout;
        self
    }

    async fn resolve(&self, audience: &Audience) -> Result<Vec<Recipient>, RepositoryError> {
        match audience {
            Audience::Users { user_ids } => self.audience.users_by_ids(user_ids).await,
            Audience::Coordinator { coordinator_id } => {
                self.audience.students_by_coordinator(*coordinator_id).await
            }
            Audience::InstitutionRole {
                institution_id,
                role,
            } => {
                self.audience
                    .users_by_institution_and_role(*institution_id, *role)
                    .await
            }
        }
    }

    #[instrument(skip(self, job), fields(kind = job.kind.as_str(), event_key = job.event_key.as_deref().unwrap_or("")))]
    pub async fn dispatch(&self, job: &NotificationJob) -> Result<FanOutReport, HandlerError> {
        let recipients = self.resolve(&job.audience).await?;
        let mut report = FanOutReport {
            recipients: recipients.len(),
            ..Default::default()
        };
        if recipients.is_empty() {
            info!("audience resolved to no recipients");
            return Ok(report);
        }

        let results: Vec<_> = stream::iter(recipients)
            .map(|recipient| async move {
                let user_id = recipient.id;
                (user_id, self.deliver(job, recipient).await)
            })
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        for (user_id, result) in results {
            match result {
                Ok(Delivery::Inserted { email }) => {
                    report.inserted += 1;
                    report.emails_enqueued += usize::from(email);
                }
                Ok(Delivery::Duplicate { email }) => {
                    report.duplicates += 1;
                    report.emails_enqueued += usize::from(email);
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "notification delivery failed");
                    report.failures.push(format!("{user_id}: {e}"));
                }
            }
        }

        info!(
            recipients = report.recipients,
            inserted = report.inserted,
            duplicates = report.duplicates,
            emails = report.emails_enqueued,
            failed = report.failures.len(),
            "notification fan-out finished"
        );
        Ok(report)
    }

    async fn deliver(&self, job: &NotificationJob, recipient: Recipient) -> Result<Delivery, HandlerError> {
        let row = NewNotification::for_recipient(job, recipient.id);
        match self.notifications.insert_notification(row).await? {
            Some(stored) => {
                self.push_realtime(&recipient, &stored).await;
                let email = self.enqueue_email(job, &recipient).await?;
                Ok(Delivery::Inserted { email })
            }
            None => {
                // An earlier attempt may have stored the row and then failed
                // before its email was queued.
                debug!(user_id = %recipient.id, "notification already stored");
                let email = self.enqueue_email(job, &recipient).await?;
                Ok(Delivery::Duplicate { email })
            }
        }
    }

    async fn push_realtime(&self, recipient: &Recipient, stored: &Notification) {
        let payload = match serde_json::to_value(stored) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(user_id = %recipient.id, error = %e, "failed to encode realtime payload");
                return;
            }
        };
        let emit = self
            .realtime
            .emit_to_user(recipient.id, NOTIFICATION_EVENT, payload);
        match tokio::time::timeout(self.external_timeout, emit).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(user_id = %recipient.id, error = %e, "realtime emit failed"),
            Err(_) => warn!(user_id = %recipient.id, "realtime emit timed out"),
        }
    }

    /// Queue the email for a recipient with a usable address. Keyed by
    /// `{event_key}:{user_id}` so a still-pending email is replaced, not
    /// doubled.
    async fn enqueue_email(&self, job: &NotificationJob, recipient: &Recipient) -> Result<bool, HandlerError> {
        let Some(address) = recipient.usable_email() else {
            return Ok(false);
        };
        let email = templates::render_email(job, address);
        let mut options = EnqueueOptions::new();
        if let Some(key) = &job.event_key {
            options = options.dedupe_key(format!("{key}:{}", recipient.id));
        }
        self.queue.enqueue(QueueName::Email, &email, options).await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl JobHandler for NotificationDispatcher {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let notification: NotificationJob = serde_json::from_value(job.payload.clone())?;
        let report = self.dispatch(&notification).await?;
        if report.failures.is_empty() {
            return Ok(());
        }
        Err(HandlerError::failed(format!(
            "{} of {} recipients failed: {}",
            report.failures.len(),
            report.recipients,
            report.failures.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Utc};
    use classrep_core::{NotificationType, UserId};
    use classrep_events::{BusRealtimeChannel, EventBus, InMemoryEventBus, RealtimeEvent};
    use classrep_infra::jobs::{
        InMemoryJobStore, JobId, JobStats, JobStatus, JobStore, JobStoreError, RetentionPolicy,
    };
    use classrep_infra::{InMemoryBackend, UserRecord};

    use super::*;

    /// Rejects the first email-lane enqueue, then behaves like the wrapped store.
    struct FirstEmailFails {
        inner: InMemoryJobStore,
        tripped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl JobStore for FirstEmailFails {
        async fn enqueue(&self, job: Job) -> Result<Option<JobId>, JobStoreError> {
            if job.queue == QueueName::Email && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.enqueue(job).await
        }
        async fn claim_next(&self, queue: QueueName) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim_next(queue).await
        }
        async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
            self.inner.update(job).await
        }
        async fn cancel(&self, queue: QueueName, key: &str) -> Result<bool, JobStoreError> {
            self.inner.cancel(queue, key).await
        }
        async fn get(&self, queue: QueueName, id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(queue, id).await
        }
        async fn list(
            &self,
            queue: QueueName,
            status: Option<JobStatus>,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list(queue, status, limit).await
        }
        async fn live_job(&self, queue: QueueName, key: &str) -> Result<Option<Job>, JobStoreError> {
            self.inner.live_job(queue, key).await
        }
        async fn next_run_at(&self, queue: QueueName) -> Result<Option<DateTime<Utc>>, JobStoreError> {
            self.inner.next_run_at(queue).await
        }
        async fn requeue_stalled(
            &self,
            queue: QueueName,
            stall_timeout: StdDuration,
        ) -> Result<usize, JobStoreError> {
            self.inner.requeue_stalled(queue, stall_timeout).await
        }
        async fn prune_completed(
            &self,
            queue: QueueName,
            retention: RetentionPolicy,
        ) -> Result<usize, JobStoreError> {
            self.inner.prune_completed(queue, retention).await
        }
        async fn retry_failed(&self, queue: QueueName, id: JobId) -> Result<Job, JobStoreError> {
            self.inner.retry_failed(queue, id).await
        }
        async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError> {
            self.inner.stats(queue).await
        }
    }

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        bus: Arc<InMemoryEventBus<RealtimeEvent>>,
        queue: JobQueue,
        dispatcher: NotificationDispatcher,
    }

    fn fixture() -> Fixture {
        fixture_on(InMemoryJobStore::arc())
    }

    fn fixture_on(store: Arc<dyn JobStore>) -> Fixture {
        let backend = InMemoryBackend::arc();
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = JobQueue::new(store);
        let dispatcher = NotificationDispatcher::new(
            backend.clone(),
            backend.clone(),
            Arc::new(BusRealtimeChannel::new(bus.clone())),
            queue.clone(),
        )
        .with_fan_out(4);
        Fixture {
            backend,
            bus,
            queue,
            dispatcher,
        }
    }

    fn job(coordinator_id: UserId) -> NotificationJob {
        NotificationJob::new(
            NotificationType::Class,
            "Class started",
            "Networks has started",
            Audience::Coordinator { coordinator_id },
        )
        .with_event_key("c1-ongoing")
    }

    #[tokio::test]
    async fn fans_out_rows_events_and_emails() {
        let f = fixture();
        let cr = UserId::new();
        let with_mail = UserRecord::student(UserId::new(), cr);
        let without_mail = UserRecord::student(UserId::new(), cr).with_email(None);
        f.backend.add_user(with_mail.clone()).unwrap();
        f.backend.add_user(without_mail).unwrap();
        let sub = f.bus.subscribe();

        let report = f.dispatcher.dispatch(&job(cr)).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.emails_enqueued, 1);
        assert_eq!(sub.drain().len(), 2);
        let emails = f.queue.list(QueueName::Email, None, 10).await.unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].payload["to"], with_mail.email.clone().unwrap());
    }

    #[tokio::test]
    async fn redelivery_skips_existing_rows() {
        let f = fixture();
        let cr = UserId::new();
        f.backend.add_user(UserRecord::student(UserId::new(), cr)).unwrap();

        f.dispatcher.dispatch(&job(cr)).await.unwrap();
        let again = f.dispatcher.dispatch(&job(cr)).await.unwrap();

        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 1);
        assert_eq!(f.backend.notifications().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_failure_fails_the_job_and_retry_completes() {
        let f = fixture();
        let cr = UserId::new();
        let ok = UserRecord::student(UserId::new(), cr);
        let flaky = UserRecord::student(UserId::new(), cr);
        f.backend.add_user(ok.clone()).unwrap();
        f.backend.add_user(flaky.clone()).unwrap();
        f.backend.fail_notifications_for(flaky.id, true).unwrap();

        let queued = Job::new(QueueName::Notification, serde_json::to_value(job(cr)).unwrap());
        let err = f.dispatcher.handle(&queued).await.unwrap_err();
        assert!(err.to_string().contains("1 of 2 recipients failed"));

        f.backend.fail_notifications_for(flaky.id, false).unwrap();
        f.dispatcher.handle(&queued).await.unwrap();

        let rows = f.backend.notifications().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|n| n.user_id == ok.id).count(), 1);
    }

    #[tokio::test]
    async fn empty_audience_succeeds() {
        let f = fixture();
        let report = f.dispatcher.dispatch(&job(UserId::new())).await.unwrap();
        assert_eq!(report.recipients, 0);
    }

    #[tokio::test]
    async fn retry_queues_email_lost_after_row_insert() {
        let f = fixture_on(Arc::new(FirstEmailFails {
            inner: InMemoryJobStore::new(),
            tripped: AtomicBool::new(false),
        }));
        let cr = UserId::new();
        let student = UserRecord::student(UserId::new(), cr);
        f.backend.add_user(student.clone()).unwrap();
        let queued = Job::new(QueueName::Notification, serde_json::to_value(job(cr)).unwrap());

        assert!(f.dispatcher.handle(&queued).await.is_err());
        f.dispatcher.handle(&queued).await.unwrap();

        assert_eq!(f.backend.notifications().unwrap().len(), 1);
        let emails = f.queue.list(QueueName::Email, None, 10).await.unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].payload["to"], student.email.clone().unwrap());
        assert_eq!(emails[0].dedupe_key.as_deref(), Some(format!("c1-ongoing:{}", student.id).as_str()));
    }
}
