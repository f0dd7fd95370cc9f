//! Status transition executor: the status-update lane consumer.
//!
//! For each job the entity is re-read and the transition is only written if
//! it is still owed ([`Lifecycle::decide`]). The write is a compare-and-set
//! on the status that was read; when it loses, the entity is re-read and the
//! decision made again from the fresh status.
//! Only an applied transition drives downstream effects (notification,
//! missing-submission backfill), except on a retried delivery that finds the
//! status already at the target: the previous attempt may have written the
//! status and then failed, so the effects are driven again. They are
//! idempotent by event key and by the `(assessment_id, student_id)` pair.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use classrep_core::{
    Assessment, AssessmentId, AssessmentRepository, AssessmentStatus, ClassId, ClassRepository,
    ClassStatus, Lifecycle, MissingSubmission, SubmissionRepository, TransitionDecision,
};
use classrep_infra::jobs::{HandlerError, Job, JobHandler};
use tracing::{debug, info, instrument};

use crate::messages;
use crate::notifier::Notifier;
use crate::payloads::StatusUpdateJob;

/// What a status-update job ended up doing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Applied,
    /// Status was already at the target; effects re-driven for a retry.
    Redriven,
    Skipped(TransitionDecision),
    EntityMissing,
}

/// Re-reads after a lost compare-and-set before the job is failed and left
/// to the queue's retry.
const MAX_WRITE_ATTEMPTS: usize = 3;

pub struct StatusTransitionExecutor {
    classes: Arc<dyn ClassRepository>,
    assessments: Arc<dyn AssessmentRepository>,
    submissions: Arc<dyn SubmissionRepository>,
    notifier: Notifier,
}

impl StatusTransitionExecutor {
    pub fn new(
        classes: Arc<dyn ClassRepository>,
        assessments: Arc<dyn AssessmentRepository>,
        submissions: Arc<dyn SubmissionRepository>,
        notifier: Notifier,
    ) -> Self {
        Self {
            classes,
            assessments,
            submissions,
            notifier,
        }
    }

    /// Apply one transition. `attempt` is the delivery attempt, starting at 1.
    pub async fn execute(
        &self,
        job: &StatusUpdateJob,
        attempt: u32,
    ) -> Result<ExecutionOutcome, HandlerError> {
        match job {
            StatusUpdateJob::Class {
                class_id,
                new_status,
                ..
            } => self.execute_class(*class_id, *new_status, attempt).await,
            StatusUpdateJob::Assessment {
                assessment_id,
                new_status,
                ..
            } => {
                self.execute_assessment(*assessment_id, *new_status, attempt)
                    .await
            }
        }
    }

    #[instrument(skip(self), fields(class_id = %id, target = %target))]
    async fn execute_class(
        &self,
        id: ClassId,
        target: ClassStatus,
        attempt: u32,
    ) -> Result<ExecutionOutcome, HandlerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(class) = self.classes.get_class(id).await? else {
                info!("class no longer exists; transition dropped");
                return Ok(ExecutionOutcome::EntityMissing);
            };

            let outcome = match ClassStatus::decide(class.status, target, class.deleted) {
                TransitionDecision::Apply => {
                    if !self.classes.transition_class(id, class.status, target).await? {
                        info!(from = %class.status, "class status changed concurrently; re-reading");
                        continue;
                    }
                    info!(from = %class.status, "class transition applied");
                    ExecutionOutcome::Applied
                }
                TransitionDecision::AlreadyApplied if attempt > 1 => ExecutionOutcome::Redriven,
                decision => {
                    info!(current = %class.status, reason = decision.reason(), "class transition skipped");
                    return Ok(ExecutionOutcome::Skipped(decision));
                }
            };

            if let Some(notification) = messages::class_status_changed(&class, target) {
                self.notifier.enqueue(&notification).await?;
            }
            return Ok(outcome);
        }
        Err(HandlerError::failed(format!(
            "class {id} changed status {MAX_WRITE_ATTEMPTS} times while applying {target}"
        )))
    }

    #[instrument(skip(self), fields(assessment_id = %id, target = %target))]
    async fn execute_assessment(
        &self,
        id: AssessmentId,
        target: AssessmentStatus,
        attempt: u32,
    ) -> Result<ExecutionOutcome, HandlerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(assessment) = self.assessments.get_assessment(id).await? else {
                info!("assessment no longer exists; transition dropped");
                return Ok(ExecutionOutcome::EntityMissing);
            };

            let outcome =
                match AssessmentStatus::decide(assessment.status, target, assessment.deleted) {
                    TransitionDecision::Apply => {
                        if !self
                            .assessments
                            .transition_assessment(id, assessment.status, target)
                            .await?
                        {
                            info!(from = %assessment.status, "assessment status changed concurrently; re-reading");
                            continue;
                        }
                        info!(from = %assessment.status, "assessment transition applied");
                        ExecutionOutcome::Applied
                    }
                    TransitionDecision::AlreadyApplied if attempt > 1 => ExecutionOutcome::Redriven,
                    decision => {
                        info!(current = %assessment.status, reason = decision.reason(), "assessment transition skipped");
                        return Ok(ExecutionOutcome::Skipped(decision));
                    }
                };

            if target == AssessmentStatus::Completed {
                self.backfill_missing(&assessment).await?;
            }
            if let Some(notification) = messages::assessment_status_changed(&assessment, target) {
                self.notifier.enqueue(&notification).await?;
            }
            return Ok(outcome);
        }
        Err(HandlerError::failed(format!(
            "assessment {id} changed status {MAX_WRITE_ATTEMPTS} times while applying {target}"
        )))
    }

    /// Insert a `MISSING` submission for every enrolled student without one.
    /// Returns the number of rows written.
    pub async fn backfill_missing(&self, assessment: &Assessment) -> Result<u64, HandlerError> {
        let enrolled = self
            .submissions
            .active_enrollments(assessment.batch_id)
            .await?;
        let submitted: HashSet<_> = self
            .submissions
            .submitted_students(assessment.id)
            .await?
            .into_iter()
            .collect();

        let now = Utc::now();
        let rows: Vec<MissingSubmission> = enrolled
            .into_iter()
            .filter(|s| !submitted.contains(s))
            .map(|student_id| MissingSubmission {
                assessment_id: assessment.id,
                student_id,
                submitted_at: now,
            })
            .collect();

        if rows.is_empty() {
            debug!(assessment_id = %assessment.id, "no missing submissions");
            return Ok(0);
        }
        let inserted = self.submissions.insert_missing_submissions(&rows).await?;
        info!(
            assessment_id = %assessment.id,
            candidates = rows.len(),
            inserted,
            "missing submissions backfilled"
        );
        Ok(inserted)
    }
}

#[async_trait::async_trait]
impl JobHandler for StatusTransitionExecutor {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: StatusUpdateJob = serde_json::from_value(job.payload.clone())?;
        let outcome = self.execute(&payload, job.attempt).await?;
        debug!(
            job_id = %job.id,
            entity_kind = %payload.entity_kind(),
            scheduled_for = %payload.scheduled_for(),
            outcome = ?outcome,
            "status update handled"
        );
        Ok(())
    }
}
