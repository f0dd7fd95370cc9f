//! `classrep-core`: domain building blocks for the scheduling engine.
//!
//! This crate contains **pure domain** types and the port traits the engine
//! depends on. No IO lives here; adapters are in `classrep-infra`.

pub mod error;
pub mod id;
pub mod model;
pub mod notification;
pub mod ports;
pub mod status;

pub use error::{DomainError, DomainResult, RepositoryError};
pub use id::{AssessmentId, BatchId, ClassId, InstitutionId, NotificationId, UserId};
pub use model::{Assessment, ClassSession, EntityKind, MissingSubmission, Recipient, Role};
pub use notification::{
    Audience, NewNotification, Notification, NotificationJob, NotificationRequest,
    NotificationType,
};
pub use ports::{
    AssessmentRepository, AudienceDirectory, ClassRepository, NotificationRepository,
    PendingFilter, SubmissionRepository,
};
pub use status::{AssessmentStatus, ClassStatus, Lifecycle, TransitionDecision};
