//! Enrollment lookups and missing-submission backfill.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use classrep_core::{
    AssessmentId, BatchId, MissingSubmission, RepositoryError, SubmissionRepository, UserId,
};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{decode_error, map_sqlx_error};

/// Postgres-backed [`SubmissionRepository`].
#[derive(Debug, Clone)]
pub struct PgSubmissionRepository {
    pool: Arc<PgPool>,
}

impl PgSubmissionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn user_ids(&self, operation: &str, sql: &str, id: &Uuid) -> Result<Vec<UserId>, RepositoryError> {
        let rows = sqlx::query(sql)
            .bind(id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("student_id")
                    .map(UserId::from_uuid)
                    .map_err(|e| decode_error(operation, e))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl SubmissionRepository for PgSubmissionRepository {
    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn active_enrollments(&self, batch_id: BatchId) -> Result<Vec<UserId>, RepositoryError> {
        self.user_ids(
            "active_enrollments",
            r#"
            SELECT DISTINCT student_id
            FROM enrollments
            WHERE batch_id = $1 AND status = 'ACTIVE'
            "#,
            batch_id.as_uuid(),
        )
        .await
    }

    #[instrument(skip(self), fields(assessment_id = %assessment_id), err)]
    async fn submitted_students(
        &self,
        assessment_id: AssessmentId,
    ) -> Result<Vec<UserId>, RepositoryError> {
        self.user_ids(
            "submitted_students",
            r#"
            SELECT DISTINCT student_id
            FROM submissions
            WHERE assessment_id = $1
            "#,
            assessment_id.as_uuid(),
        )
        .await
    }

    /// One statement for the whole batch; rows that hit the
    /// `(assessment_id, student_id)` constraint are skipped.
    #[instrument(skip(self, rows), fields(rows = rows.len()), err)]
    async fn insert_missing_submissions(
        &self,
        rows: &[MissingSubmission],
    ) -> Result<u64, RepositoryError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = rows.iter().map(|_| Uuid::now_v7()).collect();
        let assessment_ids: Vec<Uuid> = rows.iter().map(|r| *r.assessment_id.as_uuid()).collect();
        let student_ids: Vec<Uuid> = rows.iter().map(|r| *r.student_id.as_uuid()).collect();
        let submitted_at: Vec<DateTime<Utc>> = rows.iter().map(|r| r.submitted_at).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO submissions (id, assessment_id, student_id, status, submitted_at)
            SELECT id, assessment_id, student_id, $5, submitted_at
            FROM UNNEST($1::uuid[], $2::uuid[], $3::uuid[], $4::timestamptz[])
                AS t(id, assessment_id, student_id, submitted_at)
            ON CONFLICT (assessment_id, student_id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&assessment_ids)
        .bind(&student_ids)
        .bind(&submitted_at)
        .bind(MissingSubmission::STATUS)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_missing_submissions", e))?;

        debug!(inserted = result.rows_affected(), "missing submissions inserted");
        Ok(result.rows_affected())
    }
}
