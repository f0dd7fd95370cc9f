//! Notification payloads, audience selection and persisted notifications.
//!
//! Callers hand in a loose [`NotificationRequest`] (optional selector fields,
//! as produced by API handlers). It is validated into a [`NotificationJob`]
//! whose audience is a tagged [`Audience`]; only the validated form is ever
//! enqueued, so the dispatcher never sniffs optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{InstitutionId, NotificationId, UserId};
use crate::model::Role;

/// Category of a notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Class,
    Assessment,
    Notice,
    Issue,
    System,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::Class => "class",
            NotificationType::Assessment => "assessment",
            NotificationType::Notice => "notice",
            NotificationType::Issue => "issue",
            NotificationType::System => "system",
        }
    }
}

impl core::str::FromStr for NotificationType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "class" => Ok(NotificationType::Class),
            "assessment" => Ok(NotificationType::Assessment),
            "notice" => Ok(NotificationType::Notice),
            "issue" => Ok(NotificationType::Issue),
            "system" => Ok(NotificationType::System),
            other => Err(DomainError::invalid_id(format!("NotificationType: {other}"))),
        }
    }
}

/// Who receives a notification. Exactly one selector per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Audience {
    /// An explicit list of users.
    Users { user_ids: Vec<UserId> },
    /// Every student managed by a class representative.
    Coordinator { coordinator_id: UserId },
    /// Every user of a role within an institution.
    InstitutionRole {
        institution_id: InstitutionId,
        role: Role,
    },
}

/// Unvalidated notification request with optional selector fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub title: String,
    pub message: String,
    pub kind: Option<NotificationType>,
    pub related_entity_id: Option<Uuid>,
    pub explicit_user_ids: Option<Vec<UserId>>,
    pub coordinator_id: Option<UserId>,
    pub institution_id: Option<InstitutionId>,
    pub target_role: Option<Role>,
    pub event_key: Option<String>,
}

/// Validated notification job payload (the notification lane's only shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub title: String,
    pub message: String,
    pub kind: NotificationType,
    pub related_entity_id: Option<Uuid>,
    pub audience: Audience,
    /// Natural key of the triggering event; makes rows and emails idempotent.
    pub event_key: Option<String>,
}

impl NotificationJob {
    pub fn new(
        kind: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
        audience: Audience,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            related_entity_id: None,
            audience,
            event_key: None,
        }
    }

    pub fn related_to(mut self, entity_id: impl Into<Uuid>) -> Self {
        self.related_entity_id = Some(entity_id.into());
        self
    }

    pub fn with_event_key(mut self, key: impl Into<String>) -> Self {
        self.event_key = Some(key.into());
        self
    }

    /// Check invariants that the type system does not capture.
    pub fn validate(&self) -> DomainResult<()> {
        if self.title.trim().is_empty() {
            return Err(DomainError::validation("notification title must not be empty"));
        }
        if let Audience::Users { user_ids } = &self.audience {
            if user_ids.is_empty() {
                return Err(DomainError::validation("explicit audience must not be empty"));
            }
        }
        Ok(())
    }
}

impl TryFrom<NotificationRequest> for NotificationJob {
    type Error = DomainError;

    fn try_from(req: NotificationRequest) -> Result<Self, Self::Error> {
        let institution = match (req.institution_id, req.target_role) {
            (Some(institution_id), Some(role)) => Some((institution_id, role)),
            (None, None) => None,
            _ => {
                return Err(DomainError::validation(
                    "institution_id and target_role must be provided together",
                ));
            }
        };

        let selectors = usize::from(req.explicit_user_ids.is_some())
            + usize::from(req.coordinator_id.is_some())
            + usize::from(institution.is_some());

        let audience = match selectors {
            0 => return Err(DomainError::validation("notification has no audience selector")),
            1 => {
                if let Some(ids) = req.explicit_user_ids {
                    let mut user_ids = Vec::with_capacity(ids.len());
                    for id in ids {
                        if !user_ids.contains(&id) {
                            user_ids.push(id);
                        }
                    }
                    Audience::Users { user_ids }
                } else if let Some(coordinator_id) = req.coordinator_id {
                    Audience::Coordinator { coordinator_id }
                } else {
                    let (institution_id, role) = institution
                        .ok_or_else(|| DomainError::invariant("selector count mismatch"))?;
                    Audience::InstitutionRole {
                        institution_id,
                        role,
                    }
                }
            }
            _ => {
                return Err(DomainError::validation(
                    "audience selectors are mutually exclusive; set exactly one",
                ));
            }
        };

        let job = NotificationJob {
            title: req.title,
            message: req.message,
            kind: req.kind.unwrap_or(NotificationType::System),
            related_entity_id: req.related_entity_id,
            audience,
            event_key: req.event_key,
        };
        job.validate()?;
        Ok(job)
    }
}

/// Row to insert for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub kind: NotificationType,
    pub related_entity_id: Option<Uuid>,
    pub dedupe_key: Option<String>,
}

impl NewNotification {
    pub fn for_recipient(job: &NotificationJob, user_id: UserId) -> Self {
        Self {
            user_id,
            title: job.title.clone(),
            message: job.message.clone(),
            kind: job.kind,
            related_entity_id: job.related_entity_id,
            dedupe_key: job.event_key.clone(),
        }
    }
}

/// Persisted notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub related_entity_id: Option<Uuid>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub dedupe_key: Option<String>,
}

impl Notification {
    pub fn from_new(new: NewNotification, created_at: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::new(),
            user_id: new.user_id,
            title: new.title,
            message: new.message,
            kind: new.kind,
            related_entity_id: new.related_entity_id,
            is_read: false,
            created_at,
            dedupe_key: new.dedupe_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NotificationRequest {
        NotificationRequest {
            title: "Notice".into(),
            message: "Lab moved to room 4".into(),
            kind: Some(NotificationType::Notice),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_and_institution_selectors_are_rejected() {
        let req = NotificationRequest {
            explicit_user_ids: Some(vec![UserId::new()]),
            institution_id: Some(InstitutionId::new()),
            target_role: Some(Role::Student),
            ..request()
        };
        let err = NotificationJob::try_from(req).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("mutually exclusive")));
    }

    #[test]
    fn missing_selector_is_rejected() {
        assert!(NotificationJob::try_from(request()).is_err());
    }

    #[test]
    fn half_institution_selector_is_rejected() {
        let req = NotificationRequest {
            institution_id: Some(InstitutionId::new()),
            ..request()
        };
        assert!(NotificationJob::try_from(req).is_err());
    }

    #[test]
    fn empty_explicit_list_is_rejected() {
        let req = NotificationRequest {
            explicit_user_ids: Some(Vec::new()),
            ..request()
        };
        assert!(NotificationJob::try_from(req).is_err());
    }

    #[test]
    fn explicit_ids_are_deduplicated_in_order() {
        let a = UserId::new();
        let b = UserId::new();
        let req = NotificationRequest {
            explicit_user_ids: Some(vec![a, b, a]),
            ..request()
        };
        let job = NotificationJob::try_from(req).unwrap();
        assert_eq!(job.audience, Audience::Users { user_ids: vec![a, b] });
    }

    #[test]
    fn coordinator_selector_builds_tagged_audience() {
        let cr = UserId::new();
        let req = NotificationRequest {
            coordinator_id: Some(cr),
            ..request()
        };
        let job = NotificationJob::try_from(req).unwrap();
        assert_eq!(job.audience, Audience::Coordinator { coordinator_id: cr });
        assert_eq!(job.kind, NotificationType::Notice);

        let json = serde_json::to_value(&job.audience).unwrap();
        assert_eq!(json["kind"], "coordinator");
    }
}
