//! Recovery reconciler.
//!
//! Rebuilds the delayed transition jobs from entity state, which is the
//! source of truth for what is still owed. Run at process start (and on
//! demand) so that jobs lost with a flushed or restarted queue backend are
//! recreated. Every reschedule is idempotent through the dedupe keys.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use classrep_core::{
    Assessment, AssessmentRepository, AssessmentStatus, ClassRepository, ClassSession,
    ClassStatus, EntityKind, PendingFilter,
};
use futures::stream::{self, StreamExt};
use tracing::{info, instrument, warn};

use crate::error::SchedulingError;
use crate::scheduler::TransitionScheduler;
use crate::transition::ScheduledTransition;

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub classes_rescheduled: usize,
    pub assessments_rescheduled: usize,
    /// Overdue transitions enqueued for immediate execution.
    pub caught_up: usize,
    pub jobs_enqueued: usize,
    pub failures: usize,
}

enum Work {
    Class(ClassSession),
    Assessment(Assessment),
    CatchUpClass(ClassSession),
    CatchUpAssessment(Assessment),
}

impl Work {
    fn kind(&self) -> EntityKind {
        match self {
            Work::Class(_) | Work::CatchUpClass(_) => EntityKind::Class,
            Work::Assessment(_) | Work::CatchUpAssessment(_) => EntityKind::Assessment,
        }
    }

    fn is_catch_up(&self) -> bool {
        matches!(self, Work::CatchUpClass(_) | Work::CatchUpAssessment(_))
    }
}

/// Overdue transition for a class, given the status it is stuck in.
fn owed_class_transition(class: &ClassSession, now: DateTime<Utc>) -> Option<ScheduledTransition> {
    let target = match class.status {
        ClassStatus::Scheduled if class.end_time <= now => ClassStatus::Completed,
        ClassStatus::Scheduled if class.start_time < now => ClassStatus::Ongoing,
        ClassStatus::Ongoing if class.end_time < now => ClassStatus::Completed,
        _ => return None,
    };
    let at = match target {
        ClassStatus::Ongoing => class.start_time,
        _ => class.end_time,
    };
    Some(ScheduledTransition::class(class.id, class.status, target, at))
}

fn owed_assessment_transition(
    assessment: &Assessment,
    now: DateTime<Utc>,
) -> Option<ScheduledTransition> {
    let target = match assessment.status {
        AssessmentStatus::Scheduled if assessment.deadline <= now => AssessmentStatus::Completed,
        AssessmentStatus::Scheduled if assessment.start_time < now => AssessmentStatus::Active,
        AssessmentStatus::Active if assessment.deadline < now => AssessmentStatus::Completed,
        _ => return None,
    };
    let at = match target {
        AssessmentStatus::Active => assessment.start_time,
        _ => assessment.deadline,
    };
    Some(ScheduledTransition::assessment(
        assessment.id,
        assessment.status,
        target,
        at,
    ))
}

pub struct Reconciler {
    classes: Arc<dyn ClassRepository>,
    assessments: Arc<dyn AssessmentRepository>,
    scheduler: TransitionScheduler,
    fan_out: usize,
    catch_up: bool,
}

impl Reconciler {
    pub fn new(
        classes: Arc<dyn ClassRepository>,
        assessments: Arc<dyn AssessmentRepository>,
        scheduler: TransitionScheduler,
    ) -> Self {
        Self {
            classes,
            assessments,
            scheduler,
            fan_out: 16,
            catch_up: true,
        }
    }

    /// Maximum reschedule calls in flight.
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    /// Enqueue transitions whose time passed while nothing was running.
    pub fn with_catch_up(mut self, enabled: bool) -> Self {
        self.catch_up = enabled;
        self
    }

    /// One full pass. Query failures abort the pass; a failure to reschedule
    /// a single entity is logged and counted.
    #[instrument(skip(self), err)]
    pub async fn run(&self) -> Result<ReconciliationReport, SchedulingError> {
        let now = Utc::now();
        let mut work = Vec::new();

        for filter in [
            PendingFilter::AwaitingStart { now },
            PendingFilter::AwaitingEnd { now },
        ] {
            work.extend(self.classes.list_classes(filter).await?.into_iter().map(Work::Class));
            work.extend(
                self.assessments
                    .list_assessments(filter)
                    .await?
                    .into_iter()
                    .map(Work::Assessment),
            );
        }
        if self.catch_up {
            let overdue = PendingFilter::Overdue { now };
            work.extend(
                self.classes
                    .list_classes(overdue)
                    .await?
                    .into_iter()
                    .map(Work::CatchUpClass),
            );
            work.extend(
                self.assessments
                    .list_assessments(overdue)
                    .await?
                    .into_iter()
                    .map(Work::CatchUpAssessment),
            );
        }

        info!(entities = work.len(), fan_out = self.fan_out, "reconciliation started");

        let results: Vec<_> = stream::iter(work)
            .map(|item| async move {
                let kind = item.kind();
                let catch_up = item.is_catch_up();
                (kind, catch_up, self.process(item, now).await)
            })
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        let mut report = ReconciliationReport::default();
        for (kind, catch_up, result) in results {
            match result {
                Ok(enqueued) => {
                    report.jobs_enqueued += enqueued;
                    if catch_up {
                        report.caught_up += 1;
                    }
                    match kind {
                        EntityKind::Class => report.classes_rescheduled += 1,
                        EntityKind::Assessment => report.assessments_rescheduled += 1,
                    }
                }
                Err(e) => {
                    warn!(entity_kind = %kind, error = %e, "failed to reschedule entity");
                    report.failures += 1;
                }
            }
        }

        info!(
            classes = report.classes_rescheduled,
            assessments = report.assessments_rescheduled,
            caught_up = report.caught_up,
            jobs = report.jobs_enqueued,
            failures = report.failures,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Returns the number of jobs enqueued for the entity.
    async fn process(&self, item: Work, now: DateTime<Utc>) -> Result<usize, SchedulingError> {
        match item {
            Work::Class(class) => Ok(self
                .scheduler
                .schedule_class_transitions(class.id, class.start_time, class.end_time)
                .await?
                .enqueued_keys()),
            Work::Assessment(a) => Ok(self
                .scheduler
                .schedule_assessment_transitions(a.id, a.start_time, a.deadline)
                .await?
                .enqueued_keys()),
            Work::CatchUpClass(class) => {
                // Future transitions first: rescheduling cancels the stale key
                // that the overdue job is about to reuse.
                let mut enqueued = self
                    .scheduler
                    .schedule_class_transitions(class.id, class.start_time, class.end_time)
                    .await?
                    .enqueued_keys();
                if let Some(owed) = owed_class_transition(&class, now) {
                    self.scheduler.enqueue_now(&owed).await?;
                    enqueued += 1;
                }
                Ok(enqueued)
            }
            Work::CatchUpAssessment(a) => {
                let mut enqueued = self
                    .scheduler
                    .schedule_assessment_transitions(a.id, a.start_time, a.deadline)
                    .await?
                    .enqueued_keys();
                if let Some(owed) = owed_assessment_transition(&a, now) {
                    self.scheduler.enqueue_now(&owed).await?;
                    enqueued += 1;
                }
                Ok(enqueued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use classrep_core::{ClassId, UserId};

    use super::*;

    fn class(status: ClassStatus, start_min: i64, end_min: i64) -> ClassSession {
        let now = Utc::now();
        ClassSession {
            id: ClassId::new(),
            coordinator_id: UserId::new(),
            batch_id: None,
            subject: "Graphs".into(),
            start_time: now + Duration::minutes(start_min),
            end_time: now + Duration::minutes(end_min),
            status,
            deleted: false,
        }
    }

    #[test]
    fn scheduled_class_past_start_owes_ongoing() {
        let c = class(ClassStatus::Scheduled, -5, 30);
        let owed = owed_class_transition(&c, Utc::now()).unwrap();
        assert_eq!(owed.to_status, "ONGOING");
        assert_eq!(owed.dedupe_key, format!("{}-ongoing", c.id));
    }

    #[test]
    fn scheduled_class_past_end_owes_completed() {
        let c = class(ClassStatus::Scheduled, -90, -30);
        let owed = owed_class_transition(&c, Utc::now()).unwrap();
        assert_eq!(owed.to_status, "COMPLETED");
        assert_eq!(owed.from_status, "SCHEDULED");
    }

    #[test]
    fn on_time_class_owes_nothing() {
        assert!(owed_class_transition(&class(ClassStatus::Ongoing, -5, 30), Utc::now()).is_none());
        assert!(owed_class_transition(&class(ClassStatus::Cancelled, -90, -30), Utc::now()).is_none());
    }
}
