//! Entity snapshots the engine reads from persistence.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{AssessmentId, BatchId, ClassId, UserId};
use crate::status::{AssessmentStatus, ClassStatus};

/// Kind of time-bounded entity that owns scheduled transitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Class,
    Assessment,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Class => f.write_str("class"),
            EntityKind::Assessment => f.write_str("assessment"),
        }
    }
}

/// A scheduled class, as far as scheduling is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: ClassId,
    /// Class representative who owns the class; their roster is the audience.
    pub coordinator_id: UserId,
    pub batch_id: Option<BatchId>,
    pub subject: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ClassStatus,
    pub deleted: bool,
}

/// An assessment with a start time and a submission deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: AssessmentId,
    pub coordinator_id: UserId,
    pub batch_id: BatchId,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: AssessmentStatus,
    pub deleted: bool,
}

/// A resolved notification recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub id: UserId,
    pub email: Option<String>,
}

impl Recipient {
    pub fn new(id: UserId, email: Option<String>) -> Self {
        Self { id, email }
    }

    /// Email address if it looks deliverable.
    pub fn usable_email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty() && e.contains('@'))
    }
}

/// Synthetic submission inserted for students who missed a deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSubmission {
    pub assessment_id: AssessmentId,
    pub student_id: UserId,
    pub submitted_at: DateTime<Utc>,
}

impl MissingSubmission {
    /// Submission status stored for backfilled rows.
    pub const STATUS: &'static str = "MISSING";
}

/// User role, used by institution-wide audiences.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Student,
    Cr,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Cr => "CR",
            Role::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STUDENT" => Ok(Role::Student),
            "CR" => Ok(Role::Cr),
            "ADMIN" => Ok(Role::Admin),
            other => Err(DomainError::invalid_id(format!("Role: {other}"))),
        }
    }
}
