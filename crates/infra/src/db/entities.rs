//! Class and assessment repositories.

use std::sync::Arc;

use classrep_core::{
    Assessment, AssessmentId, AssessmentRepository, AssessmentStatus, BatchId, ClassId,
    ClassRepository, ClassSession, ClassStatus, Lifecycle, PendingFilter, RepositoryError, UserId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::{decode_error, map_sqlx_error};

const CLASS_COLUMNS: &str =
    "id, cr_id, batch_id, subject, start_time, end_time, status, deleted_at IS NOT NULL AS deleted";

const ASSESSMENT_COLUMNS: &str =
    "id, cr_id, batch_id, title, start_time, deadline, status, deleted_at IS NOT NULL AS deleted";

/// `WHERE` clause for a pending filter, given the in-progress status and the
/// column holding the end boundary. `$1` is `now`.
fn pending_clause(filter: &PendingFilter, in_progress: &str, end_column: &str) -> String {
    let base = match filter {
        PendingFilter::AwaitingStart { .. } => {
            "status = 'SCHEDULED' AND start_time >= $1".to_string()
        }
        PendingFilter::AwaitingEnd { .. } => {
            format!("status = '{in_progress}' AND {end_column} >= $1")
        }
        PendingFilter::Overdue { .. } => format!(
            "((status = 'SCHEDULED' AND start_time < $1) OR (status = '{in_progress}' AND {end_column} < $1))"
        ),
    };
    format!("{base} AND deleted_at IS NULL")
}

fn class_from_row(row: &PgRow) -> Result<ClassSession, RepositoryError> {
    let op = "class_from_row";
    let status: String = row.try_get("status").map_err(|e| decode_error(op, e))?;
    Ok(ClassSession {
        id: ClassId::from_uuid(row.try_get("id").map_err(|e| decode_error(op, e))?),
        coordinator_id: UserId::from_uuid(row.try_get("cr_id").map_err(|e| decode_error(op, e))?),
        batch_id: row
            .try_get::<Option<Uuid>, _>("batch_id")
            .map_err(|e| decode_error(op, e))?
            .map(BatchId::from_uuid),
        subject: row.try_get("subject").map_err(|e| decode_error(op, e))?,
        start_time: row.try_get("start_time").map_err(|e| decode_error(op, e))?,
        end_time: row.try_get("end_time").map_err(|e| decode_error(op, e))?,
        status: status.parse()?,
        deleted: row.try_get("deleted").map_err(|e| decode_error(op, e))?,
    })
}

fn assessment_from_row(row: &PgRow) -> Result<Assessment, RepositoryError> {
    let op = "assessment_from_row";
    let status: String = row.try_get("status").map_err(|e| decode_error(op, e))?;
    Ok(Assessment {
        id: AssessmentId::from_uuid(row.try_get("id").map_err(|e| decode_error(op, e))?),
        coordinator_id: UserId::from_uuid(row.try_get("cr_id").map_err(|e| decode_error(op, e))?),
        batch_id: BatchId::from_uuid(row.try_get("batch_id").map_err(|e| decode_error(op, e))?),
        title: row.try_get("title").map_err(|e| decode_error(op, e))?,
        start_time: row.try_get("start_time").map_err(|e| decode_error(op, e))?,
        deadline: row.try_get("deadline").map_err(|e| decode_error(op, e))?,
        status: status.parse()?,
        deleted: row.try_get("deleted").map_err(|e| decode_error(op, e))?,
    })
}

/// Postgres-backed [`ClassRepository`].
#[derive(Debug, Clone)]
pub struct PgClassRepository {
    pool: Arc<PgPool>,
}

impl PgClassRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl ClassRepository for PgClassRepository {
    #[instrument(skip(self), fields(class_id = %id), err)]
    async fn get_class(&self, id: ClassId) -> Result<Option<ClassSession>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CLASS_COLUMNS} FROM classes WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_class", e))?;
        row.as_ref().map(class_from_row).transpose()
    }

    #[instrument(skip(self), fields(class_id = %id, from = %from, to = %to), err)]
    async fn transition_class(
        &self,
        id: ClassId,
        from: ClassStatus,
        to: ClassStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE classes
            SET status = $3, updated_at = now()
            WHERE id = $1 AND status = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_class", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn list_classes(
        &self,
        filter: PendingFilter,
    ) -> Result<Vec<ClassSession>, RepositoryError> {
        let sql = format!(
            "SELECT {CLASS_COLUMNS} FROM classes WHERE {} ORDER BY start_time ASC",
            pending_clause(&filter, ClassStatus::Ongoing.as_str(), "end_time")
        );
        let rows = sqlx::query(&sql)
            .bind(filter.now())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_classes", e))?;
        rows.iter().map(class_from_row).collect()
    }
}

/// Postgres-backed [`AssessmentRepository`].
#[derive(Debug, Clone)]
pub struct PgAssessmentRepository {
    pool: Arc<PgPool>,
}

impl PgAssessmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl AssessmentRepository for PgAssessmentRepository {
    #[instrument(skip(self), fields(assessment_id = %id), err)]
    async fn get_assessment(
        &self,
        id: AssessmentId,
    ) -> Result<Option<Assessment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM assessments WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_assessment", e))?;
        row.as_ref().map(assessment_from_row).transpose()
    }

    #[instrument(skip(self), fields(assessment_id = %id, from = %from, to = %to), err)]
    async fn transition_assessment(
        &self,
        id: AssessmentId,
        from: AssessmentStatus,
        to: AssessmentStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE assessments
            SET status = $3, updated_at = now()
            WHERE id = $1 AND status = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_assessment", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn list_assessments(
        &self,
        filter: PendingFilter,
    ) -> Result<Vec<Assessment>, RepositoryError> {
        let sql = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM assessments WHERE {} ORDER BY start_time ASC",
            pending_clause(&filter, AssessmentStatus::Active.as_str(), "deadline")
        );
        let rows = sqlx::query(&sql)
            .bind(filter.now())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_assessments", e))?;
        rows.iter().map(assessment_from_row).collect()
    }
}
