//! Lane consumers: one claim loop per registered queue.
//!
//! Each lane has its own concurrency limit (semaphore), handler timeout,
//! stall timeout and retention. An idle lane sleeps until the earliest of its
//! next due job, the poll interval, an in-process enqueue signal or shutdown.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use classrep_core::RepositoryError;
use futures::FutureExt;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::queue::{JobQueue, QueueError};
use super::store::JobStore;
use super::types::{Job, JobStatus, QueueName, RetentionPolicy};

/// Error returned by a [`JobHandler`]. Any error fails the attempt; the
/// store's retry policy decides whether it is retried.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Consumer for one lane.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Per-lane consumer settings.
#[derive(Debug, Clone)]
pub struct LaneConfig {
    /// Maximum jobs of this lane running at once.
    pub concurrency: usize,
    /// Upper bound on idle sleep between claim attempts.
    pub poll_interval: Duration,
    pub handler_timeout: Duration,
    /// Active jobs older than this are requeued when the lane starts.
    pub stall_timeout: Duration,
    pub retention: RetentionPolicy,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(300),
            retention: RetentionPolicy::default(),
        }
    }
}

impl LaneConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// Lane runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LaneStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Attempts that failed and were scheduled for retry.
    pub jobs_retried: u64,
    /// Jobs that exhausted their attempts.
    pub jobs_failed: u64,
    pub current_running: usize,
    pub stalled_recovered: usize,
    pub uptime_secs: u64,
}

struct Lane {
    queue: QueueName,
    handler: Arc<dyn JobHandler>,
    config: LaneConfig,
}

/// Collection of lane consumers sharing one job store.
pub struct WorkerPool {
    queue: JobQueue,
    lanes: Vec<Lane>,
}

impl WorkerPool {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            lanes: Vec::new(),
        }
    }

    /// Register the consumer for `queue`, replacing any earlier registration.
    pub fn register_consumer(
        &mut self,
        queue: QueueName,
        handler: Arc<dyn JobHandler>,
        config: LaneConfig,
    ) -> &mut Self {
        self.lanes.retain(|l| l.queue != queue);
        self.lanes.push(Lane {
            queue,
            handler,
            config,
        });
        self
    }

    pub fn lanes(&self) -> Vec<QueueName> {
        self.lanes.iter().map(|l| l.queue).collect()
    }

    /// Spawn one consumer task per lane on the current tokio runtime.
    pub fn start(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.lanes.len());
        let mut stats = HashMap::new();

        for lane in self.lanes {
            let lane_stats = Arc::new(Mutex::new(LaneStats::default()));
            stats.insert(lane.queue, lane_stats.clone());

            let consumer = LaneConsumer {
                store: self.queue.store(),
                signal: self.queue.signal(lane.queue),
                queue: lane.queue,
                handler: lane.handler,
                config: lane.config,
                stats: lane_stats,
            };
            let shutdown = shutdown_rx.clone();
            let span = info_span!("lane", queue = %lane.queue);
            tasks.push(tokio::spawn(consumer.run(shutdown).instrument(span)));
        }

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
        }
    }
}

/// Handle to control a running [`WorkerPool`].
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: HashMap<QueueName, Arc<Mutex<LaneStats>>>,
}

impl WorkerPoolHandle {
    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "lane consumer task aborted");
            }
        }
        info!("worker pool stopped");
    }

    pub fn stats(&self) -> HashMap<QueueName, LaneStats> {
        self.stats
            .iter()
            .filter_map(|(q, s)| s.lock().ok().map(|s| (*q, s.clone())))
            .collect()
    }
}

struct LaneConsumer {
    store: Arc<dyn JobStore>,
    signal: Arc<Notify>,
    queue: QueueName,
    handler: Arc<dyn JobHandler>,
    config: LaneConfig,
    stats: Arc<Mutex<LaneStats>>,
}

impl LaneConsumer {
    fn update_stats(&self, f: impl FnOnce(&mut LaneStats)) {
        update_stats(&self.stats, f);
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            timeout_ms = self.config.handler_timeout.as_millis() as u64,
            "lane consumer started"
        );
        let started = Instant::now();

        match self
            .store
            .requeue_stalled(self.queue, self.config.stall_timeout)
            .await
        {
            Ok(0) => {}
            Ok(n) => {
                warn!(recovered = n, "requeued stalled jobs");
                self.update_stats(|s| s.stalled_recovered += n);
            }
            Err(e) => error!(error = %e, "failed to requeue stalled jobs"),
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "job task aborted");
                }
            }
            self.update_stats(|s| s.uptime_secs = started.elapsed().as_secs());

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.store.claim_next(self.queue).await {
                Ok(Some(job)) => {
                    let ctx = JobContext {
                        store: self.store.clone(),
                        handler: self.handler.clone(),
                        config: self.config.clone(),
                        stats: self.stats.clone(),
                    };
                    let span = info_span!("job", job_id = %job.id, attempt = job.attempt);
                    in_flight.spawn(
                        async move {
                            let _permit = permit;
                            ctx.process(job).await;
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    let wait = self.idle_wait().await;
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.signal.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "failed to claim job");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "job task aborted");
            }
        }
        info!("lane consumer stopped");
    }

    /// Sleep until the next due job, capped by the poll interval.
    async fn idle_wait(&self) -> Duration {
        match self.store.next_run_at(self.queue).await {
            Ok(Some(at)) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.config.poll_interval),
            _ => self.config.poll_interval,
        }
    }
}

struct JobContext {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    config: LaneConfig,
    stats: Arc<Mutex<LaneStats>>,
}

impl JobContext {
    async fn process(self, mut job: Job) {
        let started = Utc::now();
        update_stats(&self.stats, |s| s.current_running += 1);

        let timeout = self.config.handler_timeout;
        let outcome = match tokio::time::timeout(
            timeout,
            AssertUnwindSafe(self.handler.handle(&job)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(HandlerError::Timeout(timeout)),
        };

        match outcome {
            Ok(()) => {
                job.mark_completed(started);
                debug!("job completed");
            }
            Err(e) => {
                job.mark_failed(e.to_string(), started);
                if job.status == JobStatus::Failed {
                    error!(error = %e, attempts = job.attempt, "job failed permanently");
                } else {
                    warn!(error = %e, retry_at = %job.run_at, "job attempt failed; retry scheduled");
                }
            }
        }

        if let Err(e) = self.store.update(&job).await {
            error!(error = %e, status = ?job.status, "failed to persist job outcome");
        }

        if job.status == JobStatus::Completed {
            match self.store.prune_completed(job.queue, self.config.retention).await {
                Ok(0) => {}
                Ok(n) => debug!(pruned = n, "pruned completed jobs"),
                Err(e) => warn!(error = %e, "failed to prune completed jobs"),
            }
        }

        update_stats(&self.stats, |s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match job.status {
                JobStatus::Completed => s.jobs_succeeded += 1,
                JobStatus::Failed => s.jobs_failed += 1,
                _ => s.jobs_retried += 1,
            }
        });
    }
}

fn update_stats(stats: &Mutex<LaneStats>, f: impl FnOnce(&mut LaneStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{EnqueueOptions, RetryPolicy};

    struct Counting {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait::async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(HandlerError::failed("transient"))
            } else {
                Ok(())
            }
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl JobHandler for Panicking {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            panic!("handler bug");
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl JobHandler for Slow {
        async fn handle(&self, _job: &Job) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn fast_lane() -> LaneConfig {
        LaneConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_handler_timeout(Duration::from_millis(200))
    }

    async fn wait_for<F>(mut check: F)
    where
        F: AsyncFnMut() -> bool,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn failing_job_is_retried_until_success() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let mut pool = WorkerPool::new(queue.clone());
        pool.register_consumer(QueueName::StatusUpdate, handler.clone(), fast_lane());
        let running = pool.start();

        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let handle = queue
            .enqueue(
                QueueName::StatusUpdate,
                &serde_json::json!({}),
                EnqueueOptions::new().retry_policy(policy),
            )
            .await
            .unwrap();

        wait_for(async || {
            queue
                .get(QueueName::StatusUpdate, handle.id)
                .await
                .unwrap()
                .is_some_and(|j| j.status == JobStatus::Completed)
        })
        .await;

        let job = queue.get(QueueName::StatusUpdate, handle.id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(running.stats()[&QueueName::StatusUpdate].jobs_retried, 2);
        running.stop().await;
    }

    #[tokio::test]
    async fn panics_and_timeouts_fail_the_attempt() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let mut pool = WorkerPool::new(queue.clone());
        pool.register_consumer(QueueName::Email, Arc::new(Panicking), fast_lane())
            .register_consumer(QueueName::Reminder, Arc::new(Slow), fast_lane());
        let running = pool.start();

        let no_retry = || EnqueueOptions::new().retry_policy(RetryPolicy::no_retry());
        let panicked = queue.enqueue(QueueName::Email, &1, no_retry()).await.unwrap();
        let slow = queue.enqueue(QueueName::Reminder, &2, no_retry()).await.unwrap();

        wait_for(async || {
            let a = queue.get(QueueName::Email, panicked.id).await.unwrap();
            let b = queue.get(QueueName::Reminder, slow.id).await.unwrap();
            a.is_some_and(|j| j.status == JobStatus::Failed)
                && b.is_some_and(|j| j.status == JobStatus::Failed)
        })
        .await;

        let job = queue.get(QueueName::Email, panicked.id).await.unwrap().unwrap();
        assert!(job.last_error.unwrap().contains("handler bug"));
        let job = queue.get(QueueName::Reminder, slow.id).await.unwrap().unwrap();
        assert!(job.last_error.unwrap().contains("timed out"));
        running.stop().await;
    }

    #[tokio::test]
    async fn delayed_job_runs_after_its_delay() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let mut pool = WorkerPool::new(queue.clone());
        pool.register_consumer(QueueName::Notification, handler.clone(), fast_lane());
        let running = pool.start();

        queue
            .enqueue(
                QueueName::Notification,
                &(),
                EnqueueOptions::new().delay(Duration::from_millis(300)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        wait_for(async || handler.calls.load(Ordering::SeqCst) == 1).await;
        running.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_jobs() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let mut pool = WorkerPool::new(queue.clone());
        pool.register_consumer(
            QueueName::Reminder,
            Arc::new(Slow),
            fast_lane().with_handler_timeout(Duration::from_millis(100)),
        );
        let running = pool.start();

        let handle = queue
            .enqueue(QueueName::Reminder, &(), EnqueueOptions::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        running.stop().await;

        let job = queue.get(QueueName::Reminder, handle.id).await.unwrap().unwrap();
        assert_ne!(job.status, JobStatus::Active);
    }
}
