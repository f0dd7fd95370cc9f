//! Postgres adapters for the engine's ports.
//!
//! Table/column names follow the product database:
//!
//! | table           | columns used                                                                |
//! |-----------------|-----------------------------------------------------------------------------|
//! | `classes`       | `id, cr_id, batch_id, subject, start_time, end_time, status, deleted_at`     |
//! | `assessments`   | `id, cr_id, batch_id, title, start_time, deadline, status, deleted_at`       |
//! | `enrollments`   | `batch_id, student_id, status` (`ACTIVE`)                                   |
//! | `submissions`   | `id, assessment_id, student_id, status, submitted_at`, unique `(assessment_id, student_id)` |
//! | `users`         | `id, email, role, institution_id, cr_id, deleted_at`                         |
//! | `notifications` | `id, user_id, title, message, type, related_entity_id, is_read, created_at, dedupe_key`, unique `(user_id, dedupe_key)` |

mod audience;
mod entities;
mod notifications;
mod submissions;

use std::time::Duration;

use classrep_core::RepositoryError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

pub use audience::PgAudienceDirectory;
pub use entities::{PgAssessmentRepository, PgClassRepository};
pub use notifications::PgNotificationRepository;
pub use submissions::PgSubmissionRepository;

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, RepositoryError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;
    info!(max_connections, "database pool ready");
    Ok(pool)
}

/// All Postgres adapters over one pool.
#[derive(Debug, Clone)]
pub struct PgAdapters {
    pub classes: PgClassRepository,
    pub assessments: PgAssessmentRepository,
    pub submissions: PgSubmissionRepository,
    pub audience: PgAudienceDirectory,
    pub notifications: PgNotificationRepository,
}

impl PgAdapters {
    pub fn new(pool: PgPool) -> Self {
        Self {
            classes: PgClassRepository::new(pool.clone()),
            assessments: PgAssessmentRepository::new(pool.clone()),
            submissions: PgSubmissionRepository::new(pool.clone()),
            audience: PgAudienceDirectory::new(pool.clone()),
            notifications: PgNotificationRepository::new(pool),
        }
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => RepositoryError::Conflict(msg),
                _ => RepositoryError::Other(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            RepositoryError::unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => RepositoryError::unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            RepositoryError::corrupt(format!("failed to decode row in {operation}: {err}"))
        }
        _ => RepositoryError::other(format!("sqlx error in {operation}: {err}")),
    }
}

pub(crate) fn decode_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    RepositoryError::corrupt(format!("failed to read column in {operation}: {err}"))
}
