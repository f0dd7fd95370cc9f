//! Engine facade wiring the scheduler, lane consumers and reconciler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use classrep_core::{
    AssessmentId, AssessmentRepository, AudienceDirectory, ClassId, ClassRepository,
    NotificationJob, NotificationRepository, NotificationRequest, SubmissionRepository,
};
use classrep_events::RealtimeChannel;
use classrep_infra::jobs::{
    JobHandle, JobQueue, JobStats, LaneConfig, LaneStats, QueueName, WorkerPool, WorkerPoolHandle,
};
use classrep_infra::{EmailSender, Mailer, Settings};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::NotificationDispatcher;
use crate::error::SchedulingError;
use crate::executor::StatusTransitionExecutor;
use crate::notifier::Notifier;
use crate::reconciler::{ReconciliationReport, Reconciler};
use crate::reminder::ReminderHandler;
use crate::scheduler::{ScheduleOutcome, TransitionScheduler};

/// Adapters the engine depends on.
#[derive(Clone)]
pub struct EnginePorts {
    pub classes: Arc<dyn ClassRepository>,
    pub assessments: Arc<dyn AssessmentRepository>,
    pub submissions: Arc<dyn SubmissionRepository>,
    pub audience: Arc<dyn AudienceDirectory>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub mailer: Arc<dyn Mailer>,
}

impl EnginePorts {
    /// Use one backend for every persistence port.
    pub fn from_backend<B>(
        backend: Arc<B>,
        realtime: Arc<dyn RealtimeChannel>,
        mailer: Arc<dyn Mailer>,
    ) -> Self
    where
        B: ClassRepository
            + AssessmentRepository
            + SubmissionRepository
            + AudienceDirectory
            + NotificationRepository
            + 'static,
    {
        Self {
            classes: backend.clone(),
            assessments: backend.clone(),
            submissions: backend.clone(),
            audience: backend.clone(),
            notifications: backend,
            realtime,
            mailer,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lanes: HashMap<QueueName, LaneConfig>,
    pub reminder_lead: Option<Duration>,
    pub reconcile_fan_out: usize,
    pub catch_up: bool,
    /// Bound on real-time emits and mail API calls.
    pub external_call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let lanes = QueueName::ALL
            .into_iter()
            .map(|q| {
                let concurrency = if q == QueueName::Notification { 10 } else { 5 };
                (q, LaneConfig::default().with_concurrency(concurrency))
            })
            .collect();
        Self {
            lanes,
            reminder_lead: Some(Duration::from_secs(60 * 60)),
            reconcile_fan_out: 16,
            catch_up: true,
            external_call_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            lanes: QueueName::ALL
                .into_iter()
                .map(|q| (q, settings.lane_config(q)))
                .collect(),
            reminder_lead: settings.reminder_lead,
            reconcile_fan_out: settings.reconcile_fan_out,
            catch_up: settings.reconcile_catch_up,
            external_call_timeout: settings.external_call_timeout,
        }
    }

    pub fn with_lane(mut self, queue: QueueName, config: LaneConfig) -> Self {
        self.lanes.insert(queue, config);
        self
    }

    fn lane(&self, queue: QueueName) -> LaneConfig {
        self.lanes.get(&queue).cloned().unwrap_or_default()
    }
}

/// The scheduling and status-transition engine.
///
/// Producer operations work whether or not the engine is started; `start`
/// spawns one consumer per lane and `stop` drains them.
pub struct SchedulingEngine {
    queue: JobQueue,
    ports: EnginePorts,
    config: EngineConfig,
    scheduler: TransitionScheduler,
    notifier: Notifier,
    workers: Mutex<Option<WorkerPoolHandle>>,
}

impl SchedulingEngine {
    pub fn new(queue: JobQueue, ports: EnginePorts, config: EngineConfig) -> Self {
        let scheduler =
            TransitionScheduler::new(queue.clone()).with_reminder_lead(config.reminder_lead);
        let notifier = Notifier::new(queue.clone());
        Self {
            queue,
            ports,
            config,
            scheduler,
            notifier,
            workers: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &TransitionScheduler {
        &self.scheduler
    }

    pub async fn schedule_class_transitions(
        &self,
        class_id: ClassId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulingError> {
        self.scheduler
            .schedule_class_transitions(class_id, start, end)
            .await
    }

    pub async fn schedule_assessment_transitions(
        &self,
        assessment_id: AssessmentId,
        start: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulingError> {
        self.scheduler
            .schedule_assessment_transitions(assessment_id, start, deadline)
            .await
    }

    pub async fn cancel_transitions(&self, entity_id: impl Into<Uuid>) -> Result<usize, SchedulingError> {
        self.scheduler.cancel_transitions(entity_id.into()).await
    }

    /// Validate and enqueue a caller-built notification.
    pub async fn enqueue_notification(
        &self,
        request: NotificationRequest,
    ) -> Result<JobHandle, SchedulingError> {
        self.notifier.enqueue_request(request).await
    }

    pub async fn notify(&self, job: &NotificationJob) -> Result<JobHandle, SchedulingError> {
        self.notifier.enqueue(job).await
    }

    pub async fn run_reconciliation(&self) -> Result<ReconciliationReport, SchedulingError> {
        Reconciler::new(
            self.ports.classes.clone(),
            self.ports.assessments.clone(),
            self.scheduler.clone(),
        )
        .with_fan_out(self.config.reconcile_fan_out)
        .with_catch_up(self.config.catch_up)
        .run()
        .await
    }

    pub async fn queue_stats(&self, queue: QueueName) -> Result<JobStats, SchedulingError> {
        Ok(self.queue.stats(queue).await?)
    }

    /// Runtime counters per lane; empty while stopped.
    pub async fn lane_stats(&self) -> HashMap<QueueName, LaneStats> {
        self.workers
            .lock()
            .await
            .as_ref()
            .map(WorkerPoolHandle::stats)
            .unwrap_or_default()
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Register every lane consumer and start the worker pool. Calling it on
    /// a running engine does nothing.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            warn!("scheduling engine already running");
            return;
        }

        let p = &self.ports;
        let executor = StatusTransitionExecutor::new(
            p.classes.clone(),
            p.assessments.clone(),
            p.submissions.clone(),
            self.notifier.clone(),
        );
        let reminders = ReminderHandler::new(
            p.assessments.clone(),
            p.submissions.clone(),
            self.notifier.clone(),
        );
        let notification_lane = self.config.lane(QueueName::Notification);
        let dispatcher = NotificationDispatcher::new(
            p.audience.clone(),
            p.notifications.clone(),
            p.realtime.clone(),
            self.queue.clone(),
        )
        .with_fan_out(notification_lane.concurrency)
        .with_external_timeout(self.config.external_call_timeout);
        let emails = EmailSender::new(p.mailer.clone(), self.config.external_call_timeout);

        let mut pool = WorkerPool::new(self.queue.clone());
        pool.register_consumer(
            QueueName::StatusUpdate,
            Arc::new(executor),
            self.config.lane(QueueName::StatusUpdate),
        )
        .register_consumer(QueueName::Notification, Arc::new(dispatcher), notification_lane)
        .register_consumer(
            QueueName::Reminder,
            Arc::new(reminders),
            self.config.lane(QueueName::Reminder),
        )
        .register_consumer(QueueName::Email, Arc::new(emails), self.config.lane(QueueName::Email));

        *workers = Some(pool.start());
        info!("scheduling engine started");
    }

    /// Stop claiming jobs and wait for in-flight ones.
    pub async fn stop(&self) -> Result<(), SchedulingError> {
        let handle = self.workers.lock().await.take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                info!("scheduling engine stopped");
                Ok(())
            }
            None => Err(SchedulingError::NotRunning),
        }
    }
}

#[cfg(test)]
mod tests {
    use classrep_events::{BusRealtimeChannel, InMemoryEventBus, RealtimeEvent};
    use classrep_infra::jobs::InMemoryJobStore;
    use classrep_infra::{InMemoryBackend, TracingMailer};

    use super::*;

    fn engine() -> SchedulingEngine {
        let ports = EnginePorts::from_backend(
            InMemoryBackend::arc(),
            Arc::new(BusRealtimeChannel::new(Arc::new(
                InMemoryEventBus::<RealtimeEvent>::new(),
            ))),
            Arc::new(TracingMailer),
        );
        SchedulingEngine::new(
            JobQueue::new(InMemoryJobStore::arc()),
            ports,
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_requires_running() {
        let engine = engine();
        assert!(matches!(engine.stop().await, Err(SchedulingError::NotRunning)));

        engine.start().await;
        engine.start().await;
        assert!(engine.is_running().await);
        assert_eq!(engine.lane_stats().await.len(), 4);

        engine.stop().await.unwrap();
        assert!(!engine.is_running().await);
    }

    #[test]
    fn default_config_covers_every_lane() {
        let config = EngineConfig::default();
        for q in QueueName::ALL {
            assert!(config.lanes.contains_key(&q));
        }
        assert_eq!(config.lane(QueueName::Notification).concurrency, 10);
    }
}
