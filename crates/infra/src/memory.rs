//! In-memory implementations of every persistence port.
//!
//! One [`InMemoryBackend`] holds classes, assessments, enrollments,
//! submissions, users and notifications behind a single lock, so it can be
//! shared as each of the port trait objects. Intended for tests and local
//! development; the constraints the Postgres schema enforces (compare-and-set
//! status writes, `(assessment_id, student_id)` and `(user_id, dedupe_key)`
//! uniqueness) are enforced here too.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use classrep_core::{
    Assessment, AssessmentId, AssessmentRepository, AssessmentStatus, AudienceDirectory, BatchId,
    ClassId, ClassRepository, ClassSession, ClassStatus, InstitutionId, Lifecycle,
    MissingSubmission, NewNotification, Notification, NotificationId, NotificationRepository,
    PendingFilter, Recipient, RepositoryError, Role, SubmissionRepository, UserId,
};

/// A user row as the audience queries see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub email: Option<String>,
    pub role: Role,
    pub institution_id: Option<InstitutionId>,
    /// Class representative the student belongs to.
    pub coordinator_id: Option<UserId>,
    pub deleted: bool,
}

impl UserRecord {
    pub fn student(id: UserId, coordinator_id: UserId) -> Self {
        Self {
            id,
            email: Some(format!("{id}@students.test")),
            role: Role::Student,
            institution_id: None,
            coordinator_id: Some(coordinator_id),
            deleted: false,
        }
    }

    pub fn with_email(mut self, email: Option<&str>) -> Self {
        self.email = email.map(str::to_string);
        self
    }

    pub fn in_institution(mut self, institution_id: InstitutionId) -> Self {
        self.institution_id = Some(institution_id);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    fn recipient(&self) -> Recipient {
        Recipient::new(self.id, self.email.clone())
    }
}

#[derive(Debug, Default)]
struct Tables {
    classes: HashMap<ClassId, ClassSession>,
    assessments: HashMap<AssessmentId, Assessment>,
    enrollments: HashMap<BatchId, Vec<UserId>>,
    submissions: HashMap<(AssessmentId, UserId), String>,
    users: HashMap<UserId, UserRecord>,
    notifications: Vec<Notification>,
    failing_recipients: HashSet<UserId>,
}

/// Shared in-memory persistence.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: RwLock<Tables>,
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::unavailable("in-memory backend lock poisoned")
}

fn pending<S: Lifecycle>(
    filter: &PendingFilter,
    status: S,
    scheduled: S,
    in_progress: S,
    start: chrono::DateTime<Utc>,
    end: chrono::DateTime<Utc>,
) -> bool {
    match *filter {
        PendingFilter::AwaitingStart { now } => status == scheduled && start >= now,
        PendingFilter::AwaitingEnd { now } => status == in_progress && end >= now,
        PendingFilter::Overdue { now } => {
            (status == scheduled && start < now) || (status == in_progress && end < now)
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert_class(&self, class: ClassSession) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        t.classes.insert(class.id, class);
        Ok(())
    }

    pub fn insert_assessment(&self, assessment: Assessment) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        t.assessments.insert(assessment.id, assessment);
        Ok(())
    }

    /// Overwrite a class status directly, bypassing compare-and-set.
    pub fn set_class_status(&self, id: ClassId, status: ClassStatus) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        let class = t
            .classes
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::other(format!("unknown class {id}")))?;
        class.status = status;
        Ok(())
    }

    pub fn soft_delete_assessment(&self, id: AssessmentId) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        let assessment = t
            .assessments
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::other(format!("unknown assessment {id}")))?;
        assessment.deleted = true;
        Ok(())
    }

    pub fn add_user(&self, user: UserRecord) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        t.users.insert(user.id, user);
        Ok(())
    }

    pub fn enroll(&self, batch_id: BatchId, student_id: UserId) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        let students = t.enrollments.entry(batch_id).or_default();
        if !students.contains(&student_id) {
            students.push(student_id);
        }
        Ok(())
    }

    pub fn submit(&self, assessment_id: AssessmentId, student_id: UserId) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        t.submissions
            .insert((assessment_id, student_id), "SUBMITTED".to_string());
        Ok(())
    }

    /// Make every notification insert for `user_id` fail as unavailable.
    pub fn fail_notifications_for(&self, user_id: UserId, failing: bool) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        if failing {
            t.failing_recipients.insert(user_id);
        } else {
            t.failing_recipients.remove(&user_id);
        }
        Ok(())
    }

    pub fn class(&self, id: ClassId) -> Result<Option<ClassSession>, RepositoryError> {
        Ok(self.tables.read().map_err(poisoned)?.classes.get(&id).cloned())
    }

    pub fn assessment(&self, id: AssessmentId) -> Result<Option<Assessment>, RepositoryError> {
        Ok(self.tables.read().map_err(poisoned)?.assessments.get(&id).cloned())
    }

    /// Submission status for the pair, e.g. `MISSING`.
    pub fn submission_status(
        &self,
        assessment_id: AssessmentId,
        student_id: UserId,
    ) -> Result<Option<String>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        Ok(t.submissions.get(&(assessment_id, student_id)).cloned())
    }

    pub fn count_submissions(
        &self,
        assessment_id: AssessmentId,
        status: &str,
    ) -> Result<usize, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        Ok(t.submissions
            .iter()
            .filter(|((a, _), s)| *a == assessment_id && s.as_str() == status)
            .count())
    }

    /// Every stored notification, in insertion order.
    pub fn notifications(&self) -> Result<Vec<Notification>, RepositoryError> {
        Ok(self.tables.read().map_err(poisoned)?.notifications.clone())
    }
}

#[async_trait::async_trait]
impl ClassRepository for InMemoryBackend {
    async fn get_class(&self, id: ClassId) -> Result<Option<ClassSession>, RepositoryError> {
        self.class(id)
    }

    async fn transition_class(
        &self,
        id: ClassId,
        from: ClassStatus,
        to: ClassStatus,
    ) -> Result<bool, RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        match t.classes.get_mut(&id) {
            Some(class) if !class.deleted && class.status == from => {
                class.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_classes(
        &self,
        filter: PendingFilter,
    ) -> Result<Vec<ClassSession>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        let mut classes: Vec<_> = t
            .classes
            .values()
            .filter(|c| !c.deleted)
            .filter(|c| {
                pending(
                    &filter,
                    c.status,
                    ClassStatus::Scheduled,
                    ClassStatus::Ongoing,
                    c.start_time,
                    c.end_time,
                )
            })
            .cloned()
            .collect();
        classes.sort_by_key(|c| c.start_time);
        Ok(classes)
    }
}

#[async_trait::async_trait]
impl AssessmentRepository for InMemoryBackend {
    async fn get_assessment(
        &self,
        id: AssessmentId,
    ) -> Result<Option<Assessment>, RepositoryError> {
        self.assessment(id)
    }

    async fn transition_assessment(
        &self,
        id: AssessmentId,
        from: AssessmentStatus,
        to: AssessmentStatus,
    ) -> Result<bool, RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        match t.assessments.get_mut(&id) {
            Some(a) if !a.deleted && a.status == from => {
                a.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_assessments(
        &self,
        filter: PendingFilter,
    ) -> Result<Vec<Assessment>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        let mut assessments: Vec<_> = t
            .assessments
            .values()
            .filter(|a| !a.deleted)
            .filter(|a| {
                pending(
                    &filter,
                    a.status,
                    AssessmentStatus::Scheduled,
                    AssessmentStatus::Active,
                    a.start_time,
                    a.deadline,
                )
            })
            .cloned()
            .collect();
        assessments.sort_by_key(|a| a.start_time);
        Ok(assessments)
    }
}

#[async_trait::async_trait]
impl SubmissionRepository for InMemoryBackend {
    async fn active_enrollments(&self, batch_id: BatchId) -> Result<Vec<UserId>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        Ok(t.enrollments.get(&batch_id).cloned().unwrap_or_default())
    }

    async fn submitted_students(
        &self,
        assessment_id: AssessmentId,
    ) -> Result<Vec<UserId>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        Ok(t.submissions
            .keys()
            .filter(|(a, _)| *a == assessment_id)
            .map(|(_, s)| *s)
            .collect())
    }

    async fn insert_missing_submissions(
        &self,
        rows: &[MissingSubmission],
    ) -> Result<u64, RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        let mut inserted = 0;
        for row in rows {
            let key = (row.assessment_id, row.student_id);
            if !t.submissions.contains_key(&key) {
                t.submissions.insert(key, MissingSubmission::STATUS.to_string());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait::async_trait]
impl AudienceDirectory for InMemoryBackend {
    async fn students_by_coordinator(
        &self,
        coordinator_id: UserId,
    ) -> Result<Vec<Recipient>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        let mut users: Vec<_> = t
            .users
            .values()
            .filter(|u| !u.deleted && u.role == Role::Student)
            .filter(|u| u.coordinator_id == Some(coordinator_id))
            .map(UserRecord::recipient)
            .collect();
        users.sort_by_key(|r| r.id);
        Ok(users)
    }

    async fn users_by_institution_and_role(
        &self,
        institution_id: InstitutionId,
        role: Role,
    ) -> Result<Vec<Recipient>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        let mut users: Vec<_> = t
            .users
            .values()
            .filter(|u| !u.deleted && u.role == role)
            .filter(|u| u.institution_id == Some(institution_id))
            .map(UserRecord::recipient)
            .collect();
        users.sort_by_key(|r| r.id);
        Ok(users)
    }

    async fn users_by_ids(&self, ids: &[UserId]) -> Result<Vec<Recipient>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        Ok(ids
            .iter()
            .filter_map(|id| t.users.get(id))
            .filter(|u| !u.deleted)
            .map(UserRecord::recipient)
            .collect())
    }
}

#[async_trait::async_trait]
impl NotificationRepository for InMemoryBackend {
    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Option<Notification>, RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        if t.failing_recipients.contains(&notification.user_id) {
            return Err(RepositoryError::unavailable(format!(
                "notification insert failed for {}",
                notification.user_id
            )));
        }
        if let Some(key) = &notification.dedupe_key {
            let exists = t
                .notifications
                .iter()
                .any(|n| n.user_id == notification.user_id && n.dedupe_key.as_ref() == Some(key));
            if exists {
                return Ok(None);
            }
        }
        let row = Notification::from_new(notification, Utc::now());
        t.notifications.push(row.clone());
        Ok(Some(row))
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, RepositoryError> {
        let t = self.tables.read().map_err(poisoned)?;
        Ok(t.notifications
            .iter()
            .rev()
            .filter(|n| n.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, user_id: UserId, id: NotificationId) -> Result<bool, RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        match t
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
        {
            Some(n) => {
                n.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_notification(
        &self,
        user_id: UserId,
        id: NotificationId,
    ) -> Result<bool, RepositoryError> {
        let mut t = self.tables.write().map_err(poisoned)?;
        let before = t.notifications.len();
        t.notifications.retain(|n| !(n.id == id && n.user_id == user_id));
        Ok(t.notifications.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use classrep_core::NotificationType;

    use super::*;

    fn class(start_offset_min: i64, end_offset_min: i64, status: ClassStatus) -> ClassSession {
        let now = Utc::now();
        ClassSession {
            id: ClassId::new(),
            coordinator_id: UserId::new(),
            batch_id: None,
            subject: "Signals".into(),
            start_time: now + Duration::minutes(start_offset_min),
            end_time: now + Duration::minutes(end_offset_min),
            status,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn class_transition_is_compare_and_set() {
        let backend = InMemoryBackend::new();
        let c = class(10, 70, ClassStatus::Scheduled);
        backend.insert_class(c.clone()).unwrap();

        assert!(
            backend
                .transition_class(c.id, ClassStatus::Scheduled, ClassStatus::Ongoing)
                .await
                .unwrap()
        );
        assert!(
            !backend
                .transition_class(c.id, ClassStatus::Scheduled, ClassStatus::Ongoing)
                .await
                .unwrap()
        );
        assert_eq!(backend.class(c.id).unwrap().unwrap().status, ClassStatus::Ongoing);
    }

    #[tokio::test]
    async fn pending_filters_split_by_boundary() {
        let backend = InMemoryBackend::new();
        let upcoming = class(10, 70, ClassStatus::Scheduled);
        let running = class(-10, 50, ClassStatus::Ongoing);
        let overdue = class(-70, -10, ClassStatus::Ongoing);
        let cancelled = class(10, 70, ClassStatus::Cancelled);
        for c in [&upcoming, &running, &overdue, &cancelled] {
            backend.insert_class(c.clone()).unwrap();
        }

        let now = Utc::now();
        let ids = |v: Vec<ClassSession>| v.into_iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(
            ids(backend.list_classes(PendingFilter::AwaitingStart { now }).await.unwrap()),
            vec![upcoming.id]
        );
        assert_eq!(
            ids(backend.list_classes(PendingFilter::AwaitingEnd { now }).await.unwrap()),
            vec![running.id]
        );
        assert_eq!(
            ids(backend.list_classes(PendingFilter::Overdue { now }).await.unwrap()),
            vec![overdue.id]
        );
    }

    #[tokio::test]
    async fn missing_submissions_skip_existing_pairs() {
        let backend = InMemoryBackend::new();
        let assessment_id = AssessmentId::new();
        let done = UserId::new();
        let absent = UserId::new();
        backend.submit(assessment_id, done).unwrap();

        let rows: Vec<_> = [done, absent]
            .into_iter()
            .map(|student_id| MissingSubmission {
                assessment_id,
                student_id,
                submitted_at: Utc::now(),
            })
            .collect();

        assert_eq!(backend.insert_missing_submissions(&rows).await.unwrap(), 1);
        assert_eq!(backend.insert_missing_submissions(&rows).await.unwrap(), 0);
        assert_eq!(
            backend.submission_status(assessment_id, absent).unwrap().as_deref(),
            Some("MISSING")
        );
    }

    #[tokio::test]
    async fn notification_insert_is_idempotent_per_key() {
        let backend = InMemoryBackend::new();
        let user = UserId::new();
        let row = |key: Option<&str>| NewNotification {
            user_id: user,
            title: "Class started".into(),
            message: "Signals is now ongoing".into(),
            kind: NotificationType::Class,
            related_entity_id: None,
            dedupe_key: key.map(str::to_string),
        };

        assert!(backend.insert_notification(row(Some("c1-ongoing"))).await.unwrap().is_some());
        assert!(backend.insert_notification(row(Some("c1-ongoing"))).await.unwrap().is_none());
        assert!(backend.insert_notification(row(None)).await.unwrap().is_some());
        assert!(backend.insert_notification(row(None)).await.unwrap().is_some());
        assert_eq!(backend.list_for_user(user, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn mark_read_and_delete_are_scoped_to_owner() {
        let backend = InMemoryBackend::new();
        let owner = UserId::new();
        let stranger = UserId::new();
        let stored = backend
            .insert_notification(NewNotification {
                user_id: owner,
                title: "Notice".into(),
                message: "Lab moved".into(),
                kind: NotificationType::Notice,
                related_entity_id: None,
                dedupe_key: None,
            })
            .await
            .unwrap()
            .unwrap();

        assert!(!backend.mark_read(stranger, stored.id).await.unwrap());
        assert!(backend.mark_read(owner, stored.id).await.unwrap());
        assert!(backend.list_for_user(owner, 1).await.unwrap()[0].is_read);
        assert!(!backend.delete_notification(stranger, stored.id).await.unwrap());
        assert!(backend.delete_notification(owner, stored.id).await.unwrap());
        assert!(backend.notifications().unwrap().is_empty());
    }

    #[tokio::test]
    async fn audience_queries_ignore_deleted_users() {
        let backend = InMemoryBackend::new();
        let cr = UserId::new();
        let institution = InstitutionId::new();
        let active = UserRecord::student(UserId::new(), cr).in_institution(institution);
        let mut gone = UserRecord::student(UserId::new(), cr).in_institution(institution);
        gone.deleted = true;
        backend.add_user(active.clone()).unwrap();
        backend.add_user(gone.clone()).unwrap();

        let by_cr = backend.students_by_coordinator(cr).await.unwrap();
        assert_eq!(by_cr.len(), 1);
        assert_eq!(by_cr[0].id, active.id);

        let by_role = backend
            .users_by_institution_and_role(institution, Role::Student)
            .await
            .unwrap();
        assert_eq!(by_role.len(), 1);

        let by_ids = backend
            .users_by_ids(&[active.id, gone.id, UserId::new()])
            .await
            .unwrap();
        assert_eq!(by_ids.len(), 1);
    }
}
