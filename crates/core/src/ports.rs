//! Persistence and audience ports consumed by the engine.
//!
//! Scheduling, execution and fan-out logic depend only on these traits.
//! Concrete adapters (Postgres, in-memory) live in `classrep-infra`.

use chrono::{DateTime, Utc};

use crate::error::RepositoryError;
use crate::id::{AssessmentId, BatchId, ClassId, InstitutionId, NotificationId, UserId};
use crate::model::{Assessment, ClassSession, MissingSubmission, Recipient, Role};
use crate::notification::{NewNotification, Notification};
use crate::status::{AssessmentStatus, ClassStatus};

/// Selection of non-deleted entities whose time-driven transitions are still owed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PendingFilter {
    /// `SCHEDULED` with a start time at or after `now`.
    AwaitingStart { now: DateTime<Utc> },
    /// In progress (`ONGOING` / `ACTIVE`) with an end time at or after `now`.
    AwaitingEnd { now: DateTime<Utc> },
    /// Not yet finished but already past a boundary: `SCHEDULED` with a start
    /// before `now`, or in progress with an end before `now`.
    Overdue { now: DateTime<Utc> },
}

impl PendingFilter {
    pub fn now(&self) -> DateTime<Utc> {
        match *self {
            PendingFilter::AwaitingStart { now }
            | PendingFilter::AwaitingEnd { now }
            | PendingFilter::Overdue { now } => now,
        }
    }
}

#[async_trait::async_trait]
pub trait ClassRepository: Send + Sync {
    /// Load a class, including soft-deleted ones (`deleted = true`).
    async fn get_class(&self, id: ClassId) -> Result<Option<ClassSession>, RepositoryError>;

    /// Compare-and-set the status. Returns `false` when the class was not in
    /// `from` (or is deleted) at write time.
    async fn transition_class(
        &self,
        id: ClassId,
        from: ClassStatus,
        to: ClassStatus,
    ) -> Result<bool, RepositoryError>;

    async fn list_classes(&self, filter: PendingFilter)
    -> Result<Vec<ClassSession>, RepositoryError>;
}

#[async_trait::async_trait]
pub trait AssessmentRepository: Send + Sync {
    async fn get_assessment(
        &self,
        id: AssessmentId,
    ) -> Result<Option<Assessment>, RepositoryError>;

    async fn transition_assessment(
        &self,
        id: AssessmentId,
        from: AssessmentStatus,
        to: AssessmentStatus,
    ) -> Result<bool, RepositoryError>;

    async fn list_assessments(
        &self,
        filter: PendingFilter,
    ) -> Result<Vec<Assessment>, RepositoryError>;
}

#[async_trait::async_trait]
pub trait SubmissionRepository: Send + Sync {
    /// Students with an active enrollment in the batch.
    async fn active_enrollments(&self, batch_id: BatchId) -> Result<Vec<UserId>, RepositoryError>;

    /// Students that already have any submission row for the assessment.
    async fn submitted_students(
        &self,
        assessment_id: AssessmentId,
    ) -> Result<Vec<UserId>, RepositoryError>;

    /// Insert all rows in one batch, skipping `(assessment_id, student_id)`
    /// conflicts. Returns the number of rows actually inserted.
    async fn insert_missing_submissions(
        &self,
        rows: &[MissingSubmission],
    ) -> Result<u64, RepositoryError>;
}

/// Resolves audience selectors into recipients.
#[async_trait::async_trait]
pub trait AudienceDirectory: Send + Sync {
    async fn students_by_coordinator(
        &self,
        coordinator_id: UserId,
    ) -> Result<Vec<Recipient>, RepositoryError>;

    async fn users_by_institution_and_role(
        &self,
        institution_id: InstitutionId,
        role: Role,
    ) -> Result<Vec<Recipient>, RepositoryError>;

    /// Known users among `ids`; unknown ids are simply absent from the result.
    async fn users_by_ids(&self, ids: &[UserId]) -> Result<Vec<Recipient>, RepositoryError>;
}

#[async_trait::async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert a row. When `dedupe_key` is set and a row for the same
    /// `(user_id, dedupe_key)` exists, nothing is written and `None` is returned.
    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Option<Notification>, RepositoryError>;

    /// Newest first.
    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, RepositoryError>;

    async fn mark_read(
        &self,
        user_id: UserId,
        id: NotificationId,
    ) -> Result<bool, RepositoryError>;

    async fn delete_notification(
        &self,
        user_id: UserId,
        id: NotificationId,
    ) -> Result<bool, RepositoryError>;
}
