//! Audience resolution against the `users` table.

use std::sync::Arc;

use classrep_core::{AudienceDirectory, InstitutionId, Recipient, RepositoryError, Role, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::{decode_error, map_sqlx_error};

fn recipient_from_row(row: &PgRow) -> Result<Recipient, RepositoryError> {
    let id: Uuid = row.try_get("id").map_err(|e| decode_error("recipient", e))?;
    let email: Option<String> = row.try_get("email").map_err(|e| decode_error("recipient", e))?;
    Ok(Recipient::new(UserId::from_uuid(id), email))
}

/// Postgres-backed [`AudienceDirectory`].
#[derive(Debug, Clone)]
pub struct PgAudienceDirectory {
    pool: Arc<PgPool>,
}

impl PgAudienceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl AudienceDirectory for PgAudienceDirectory {
    #[instrument(skip(self), fields(coordinator_id = %coordinator_id), err)]
    async fn students_by_coordinator(
        &self,
        coordinator_id: UserId,
    ) -> Result<Vec<Recipient>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, email
            FROM users
            WHERE cr_id = $1 AND role = 'STUDENT' AND deleted_at IS NULL
            ORDER BY id
            "#,
        )
        .bind(coordinator_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("students_by_coordinator", e))?;
        rows.iter().map(recipient_from_row).collect()
    }

    #[instrument(skip(self), fields(institution_id = %institution_id, role = %role), err)]
    async fn users_by_institution_and_role(
        &self,
        institution_id: InstitutionId,
        role: Role,
    ) -> Result<Vec<Recipient>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, email
            FROM users
            WHERE institution_id = $1 AND role = $2 AND deleted_at IS NULL
            ORDER BY id
            "#,
        )
        .bind(institution_id.as_uuid())
        .bind(role.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("users_by_institution_and_role", e))?;
        rows.iter().map(recipient_from_row).collect()
    }

    #[instrument(skip(self, ids), fields(requested = ids.len()), err)]
    async fn users_by_ids(&self, ids: &[UserId]) -> Result<Vec<Recipient>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, email
            FROM users
            WHERE id = ANY($1) AND deleted_at IS NULL
            "#,
        )
        .bind(&uuids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("users_by_ids", e))?;
        rows.iter().map(recipient_from_row).collect()
    }
}
