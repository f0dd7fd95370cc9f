//! Status transition scheduler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use classrep_core::{AssessmentId, ClassId};
use classrep_infra::jobs::{EnqueueOptions, JobHandle, JobQueue, QueueName};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::SchedulingError;
use crate::payloads::ReminderJob;
use crate::transition::{
    OWNED_SUFFIXES, REMINDER_SUFFIX, ScheduledTransition, assessment_transitions,
    class_transitions, delay_until, reminder_at, transition_key,
};

/// Result of one scheduling call.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    pub enqueued: Vec<JobHandle>,
    /// Keys whose trigger time was not in the future.
    pub skipped: Vec<String>,
}

impl ScheduleOutcome {
    pub fn enqueued_keys(&self) -> usize {
        self.enqueued.len()
    }
}

/// Turns entity timestamps into delayed status-update (and reminder) jobs.
///
/// Scheduling is a full recompute: both transitions are derived again and
/// enqueued under their dedupe keys, replacing whatever was pending. A
/// transition whose time already passed is not enqueued, and any job still
/// pending under its key is cancelled since the new schedule supersedes it.
#[derive(Debug, Clone)]
pub struct TransitionScheduler {
    queue: JobQueue,
    reminder_lead: Option<Duration>,
}

impl TransitionScheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            reminder_lead: None,
        }
    }

    /// Enqueue a deadline reminder this long before each assessment deadline.
    pub fn with_reminder_lead(mut self, lead: Option<Duration>) -> Self {
        self.reminder_lead = lead.filter(|l| !l.is_zero());
        self
    }

    #[instrument(skip(self), fields(class_id = %class_id), err)]
    pub async fn schedule_class_transitions(
        &self,
        class_id: ClassId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulingError> {
        let now = Utc::now();
        let mut outcome = ScheduleOutcome::default();
        for transition in class_transitions(class_id, start, end) {
            self.schedule(&transition, now, &mut outcome).await?;
        }
        Ok(outcome)
    }

    #[instrument(skip(self), fields(assessment_id = %assessment_id), err)]
    pub async fn schedule_assessment_transitions(
        &self,
        assessment_id: AssessmentId,
        start: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulingError> {
        let now = Utc::now();
        let mut outcome = ScheduleOutcome::default();
        for transition in assessment_transitions(assessment_id, start, deadline) {
            self.schedule(&transition, now, &mut outcome).await?;
        }

        if let Some(lead) = self.reminder_lead {
            let key = transition_key(assessment_id, REMINDER_SUFFIX);
            match reminder_at(start, deadline, lead, now).and_then(|at| delay_until(at, now)) {
                Some(delay) => {
                    let payload = ReminderJob {
                        assessment_id,
                        deadline,
                    };
                    let handle = self
                        .queue
                        .enqueue(
                            QueueName::Reminder,
                            &payload,
                            EnqueueOptions::new().delay(delay).dedupe_key(key),
                        )
                        .await?;
                    outcome.enqueued.push(handle);
                }
                None => {
                    self.queue.cancel(QueueName::Reminder, &key).await?;
                    outcome.skipped.push(key);
                }
            }
        }
        Ok(outcome)
    }

    /// Enqueue a transition to run immediately, under its usual dedupe key.
    #[instrument(skip(self, transition), fields(dedupe_key = %transition.dedupe_key), err)]
    pub async fn enqueue_now(
        &self,
        transition: &ScheduledTransition,
    ) -> Result<JobHandle, SchedulingError> {
        let handle = self
            .queue
            .enqueue(
                QueueName::StatusUpdate,
                &transition.payload,
                EnqueueOptions::new().dedupe_key(transition.dedupe_key.clone()),
            )
            .await?;
        info!(
            entity_kind = %transition.entity_kind,
            to_status = transition.to_status,
            "overdue transition enqueued"
        );
        Ok(handle)
    }

    /// Cancel every pending job the entity may own. Safe to call for keys
    /// that were never scheduled.
    #[instrument(skip(self), err)]
    pub async fn cancel_transitions(&self, entity_id: Uuid) -> Result<usize, SchedulingError> {
        let mut cancelled = 0;
        for suffix in OWNED_SUFFIXES {
            let queue = if suffix == REMINDER_SUFFIX {
                QueueName::Reminder
            } else {
                QueueName::StatusUpdate
            };
            if self.queue.cancel(queue, &transition_key(entity_id, suffix)).await? {
                cancelled += 1;
            }
        }
        debug!(cancelled, "transitions cancelled");
        Ok(cancelled)
    }

    async fn schedule(
        &self,
        transition: &ScheduledTransition,
        now: DateTime<Utc>,
        outcome: &mut ScheduleOutcome,
    ) -> Result<(), SchedulingError> {
        match transition.delay_from(now) {
            Some(delay) => {
                let handle = self
                    .queue
                    .enqueue(
                        QueueName::StatusUpdate,
                        &transition.payload,
                        EnqueueOptions::new()
                            .delay(delay)
                            .dedupe_key(transition.dedupe_key.clone()),
                    )
                    .await?;
                debug!(
                    dedupe_key = %transition.dedupe_key,
                    run_at = %handle.run_at,
                    replaced = ?handle.replaced,
                    "transition scheduled"
                );
                outcome.enqueued.push(handle);
            }
            None => {
                self.queue
                    .cancel(QueueName::StatusUpdate, &transition.dedupe_key)
                    .await?;
                debug!(dedupe_key = %transition.dedupe_key, "transition time passed; skipped");
                outcome.skipped.push(transition.dedupe_key.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use classrep_infra::jobs::{InMemoryJobStore, JobStatus};

    use super::*;

    fn scheduler() -> TransitionScheduler {
        TransitionScheduler::new(JobQueue::new(InMemoryJobStore::arc()))
            .with_reminder_lead(Some(Duration::from_secs(3_600)))
    }

    #[tokio::test]
    async fn rescheduling_keeps_one_job_per_key() {
        let s = scheduler();
        let id = ClassId::new();
        let start = Utc::now() + ChronoDuration::hours(1);
        let end = start + ChronoDuration::hours(1);

        s.schedule_class_transitions(id, start, end).await.unwrap();
        let second = s
            .schedule_class_transitions(id, start + ChronoDuration::minutes(5), end)
            .await
            .unwrap();

        assert!(second.enqueued.iter().all(|h| h.replaced.is_some()));
        let stats = s.queue.stats(QueueName::StatusUpdate).await.unwrap();
        assert_eq!(stats.delayed, 2);
    }

    #[tokio::test]
    async fn past_start_is_skipped() {
        let s = scheduler();
        let id = ClassId::new();
        let now = Utc::now();

        let outcome = s
            .schedule_class_transitions(id, now - ChronoDuration::minutes(5), now + ChronoDuration::hours(1))
            .await
            .unwrap();

        assert_eq!(outcome.enqueued_keys(), 1);
        assert_eq!(outcome.skipped, vec![format!("{id}-ongoing")]);
        assert!(
            s.queue
                .live_job(QueueName::StatusUpdate, &format!("{id}-completed"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn moving_start_into_the_past_cancels_stale_job() {
        let s = scheduler();
        let id = ClassId::new();
        let now = Utc::now();
        let end = now + ChronoDuration::hours(2);

        s.schedule_class_transitions(id, now + ChronoDuration::hours(1), end)
            .await
            .unwrap();
        s.schedule_class_transitions(id, now - ChronoDuration::minutes(1), end)
            .await
            .unwrap();

        let key = format!("{id}-ongoing");
        assert!(s.queue.live_job(QueueName::StatusUpdate, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assessment_schedule_includes_reminder() {
        let s = scheduler();
        let id = AssessmentId::new();
        let start = Utc::now() + ChronoDuration::minutes(10);
        let deadline = start + ChronoDuration::hours(3);

        let outcome = s
            .schedule_assessment_transitions(id, start, deadline)
            .await
            .unwrap();

        assert_eq!(outcome.enqueued_keys(), 3);
        let reminder = s
            .queue
            .live_job(QueueName::Reminder, &format!("{id}-reminder"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reminder.status, JobStatus::Delayed);
        let payload: ReminderJob = serde_json::from_value(reminder.payload).unwrap();
        assert_eq!(payload.deadline, deadline);
    }

    #[tokio::test]
    async fn cancel_clears_every_owned_key() {
        let s = scheduler();
        let id = AssessmentId::new();
        let start = Utc::now() + ChronoDuration::minutes(10);
        s.schedule_assessment_transitions(id, start, start + ChronoDuration::hours(3))
            .await
            .unwrap();

        assert_eq!(s.cancel_transitions(*id.as_uuid()).await.unwrap(), 3);
        assert_eq!(s.cancel_transitions(*id.as_uuid()).await.unwrap(), 0);
        let stats = s.queue.stats(QueueName::StatusUpdate).await.unwrap();
        assert_eq!(stats.pending(), 0);
    }
}
