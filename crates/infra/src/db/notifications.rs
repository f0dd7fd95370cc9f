//! Persisted in-app notifications.

use std::sync::Arc;

use classrep_core::{
    NewNotification, Notification, NotificationId, NotificationRepository, RepositoryError, UserId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::{decode_error, map_sqlx_error};

const COLUMNS: &str =
    "id, user_id, title, message, type, related_entity_id, is_read, created_at, dedupe_key";

fn notification_from_row(row: &PgRow) -> Result<Notification, RepositoryError> {
    let op = "notification_from_row";
    let kind: String = row.try_get("type").map_err(|e| decode_error(op, e))?;
    Ok(Notification {
        id: NotificationId::from_uuid(row.try_get("id").map_err(|e| decode_error(op, e))?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(|e| decode_error(op, e))?),
        title: row.try_get("title").map_err(|e| decode_error(op, e))?,
        message: row.try_get("message").map_err(|e| decode_error(op, e))?,
        kind: kind.parse()?,
        related_entity_id: row.try_get("related_entity_id").map_err(|e| decode_error(op, e))?,
        is_read: row.try_get("is_read").map_err(|e| decode_error(op, e))?,
        created_at: row.try_get("created_at").map_err(|e| decode_error(op, e))?,
        dedupe_key: row.try_get("dedupe_key").map_err(|e| decode_error(op, e))?,
    })
}

/// Postgres-backed [`NotificationRepository`].
#[derive(Debug, Clone)]
pub struct PgNotificationRepository {
    pool: Arc<PgPool>,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl NotificationRepository for PgNotificationRepository {
    /// `RETURNING` yields no row when the `(user_id, dedupe_key)` constraint
    /// swallowed the insert. NULL keys never conflict.
    #[instrument(skip(self, notification), fields(user_id = %notification.user_id), err)]
    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Option<Notification>, RepositoryError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO notifications
                (id, user_id, title, message, type, related_entity_id, is_read, created_at, dedupe_key)
            VALUES ($1, $2, $3, $4, $5, $6, false, now(), $7)
            ON CONFLICT (user_id, dedupe_key) DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(notification.user_id.as_uuid())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.kind.as_str())
        .bind(notification.related_entity_id)
        .bind(&notification.dedupe_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_notification", e))?;
        row.as_ref().map(notification_from_row).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM notifications WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(user_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_user", e))?;
        rows.iter().map(notification_from_row).collect()
    }

    #[instrument(skip(self), fields(user_id = %user_id, notification_id = %id), err)]
    async fn mark_read(&self, user_id: UserId, id: NotificationId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = true WHERE id = $1 AND user_id = $2",
        )
        .bind(id.as_uuid())
        .bind(user_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_read", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(user_id = %user_id, notification_id = %id), err)]
    async fn delete_notification(
        &self,
        user_id: UserId,
        id: NotificationId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1 AND user_id = $2")
            .bind(id.as_uuid())
            .bind(user_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_notification", e))?;
        Ok(result.rows_affected() == 1)
    }
}
