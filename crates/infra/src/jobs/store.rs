//! Job storage: the [`JobStore`] contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{Job, JobId, JobStatus, QueueName, RetentionPolicy};

/// Durable job storage.
///
/// Implementations must make `enqueue` (with dedupe replacement), `claim_next`
/// and `cancel` atomic with respect to each other; that is what gives
/// at-most-one active execution per job id across consumers and processes.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job. When it carries a dedupe key and a Waiting/Delayed job
    /// with the same key exists in the lane, that job is removed first and
    /// its id returned. An Active job with the key is left running; the new
    /// job becomes the live one for the key.
    async fn enqueue(&self, job: Job) -> Result<Option<JobId>, JobStoreError>;

    /// Atomically claim the next due job in the lane: mark it Active and bump
    /// its attempt counter.
    async fn claim_next(&self, queue: QueueName) -> Result<Option<Job>, JobStoreError>;

    /// Persist the outcome of an attempt (Completed, Delayed for a retry, or Failed).
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Remove the pending job for `dedupe_key`. Returns `false` when there is
    /// none (never enqueued, already running or finished).
    async fn cancel(&self, queue: QueueName, dedupe_key: &str) -> Result<bool, JobStoreError>;

    async fn get(&self, queue: QueueName, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs in the lane, oldest `run_at` first, optionally filtered by
    /// effective status (a due Delayed job counts as Waiting).
    async fn list(
        &self,
        queue: QueueName,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// The job currently registered for `dedupe_key`, if any.
    async fn live_job(
        &self,
        queue: QueueName,
        dedupe_key: &str,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Earliest `run_at` among pending jobs of the lane.
    async fn next_run_at(&self, queue: QueueName) -> Result<Option<DateTime<Utc>>, JobStoreError>;

    /// Put jobs that have been Active longer than `stall_timeout` back to
    /// Waiting. Returns how many were recovered.
    async fn requeue_stalled(
        &self,
        queue: QueueName,
        stall_timeout: Duration,
    ) -> Result<usize, JobStoreError>;

    /// Drop completed jobs beyond the retention policy. Failed jobs are kept.
    async fn prune_completed(
        &self,
        queue: QueueName,
        retention: RetentionPolicy,
    ) -> Result<usize, JobStoreError>;

    /// Move a Failed job back to Waiting with a fresh attempt budget.
    async fn retry_failed(&self, queue: QueueName, id: JobId) -> Result<Job, JobStoreError>;

    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {status:?}, expected {expected:?}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        expected: JobStatus,
    },
    #[error("job serialization failed: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for JobStoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Per-lane job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed
    }

    fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Delayed => self.delayed += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    dedupe: HashMap<(QueueName, String), JobId>,
}

impl Inner {
    fn lane(&self, queue: QueueName) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(move |j| j.queue == queue)
    }

    /// Drop the dedupe entry if it still points at `job`.
    fn release_key(&mut self, job: &Job) {
        if let Some(key) = &job.dedupe_key {
            let index_key = (job.queue, key.clone());
            if self.dedupe.get(&index_key) == Some(&job.id) {
                self.dedupe.remove(&index_key);
            }
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("in-memory job store lock poisoned".to_string())
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every job in every lane; test inspection helper.
    pub fn snapshot(&self) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut jobs: Vec<_> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.run_at, j.created_at));
        Ok(jobs)
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<Option<JobId>, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let mut replaced = None;

        if let Some(key) = &job.dedupe_key {
            let index_key = (job.queue, key.clone());
            if let Some(existing) = inner.dedupe.get(&index_key).copied() {
                let pending = inner
                    .jobs
                    .get(&existing)
                    .is_some_and(|j| j.status.is_pending());
                if pending {
                    inner.jobs.remove(&existing);
                    replaced = Some(existing);
                }
            }
            inner.dedupe.insert(index_key, job.id);
        }

        inner.jobs.insert(job.id, job);
        Ok(replaced)
    }

    async fn claim_next(&self, queue: QueueName) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let now = Utc::now();

        let next = inner
            .lane(queue)
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| (j.run_at, j.created_at))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            inner.jobs.get_mut(&id).map(|job| {
                job.mark_active();
                job.clone()
            })
        }))
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if !inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        if job.status.is_terminal() {
            inner.release_key(job);
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn cancel(&self, queue: QueueName, dedupe_key: &str) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let index_key = (queue, dedupe_key.to_string());
        let Some(id) = inner.dedupe.get(&index_key).copied() else {
            return Ok(false);
        };

        let pending = inner.jobs.get(&id).is_some_and(|j| j.status.is_pending());
        if !pending {
            return Ok(false);
        }
        inner.jobs.remove(&id);
        inner.dedupe.remove(&index_key);
        Ok(true)
    }

    async fn get(&self, queue: QueueName, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.jobs.get(&id).filter(|j| j.queue == queue).cloned())
    }

    async fn list(
        &self,
        queue: QueueName,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let now = Utc::now();
        let mut result: Vec<_> = inner
            .lane(queue)
            .filter(|j| status.is_none_or(|s| j.effective_status(now) == s))
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.run_at, j.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn live_job(
        &self,
        queue: QueueName,
        dedupe_key: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .dedupe
            .get(&(queue, dedupe_key.to_string()))
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn next_run_at(&self, queue: QueueName) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .lane(queue)
            .filter(|j| j.status.is_pending())
            .map(|j| j.run_at)
            .min())
    }

    async fn requeue_stalled(
        &self,
        queue: QueueName,
        stall_timeout: Duration,
    ) -> Result<usize, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stall_timeout).unwrap_or(chrono::Duration::MAX);
        let mut recovered = 0;
        for job in inner.jobs.values_mut() {
            if job.queue == queue && job.status == JobStatus::Active && job.updated_at <= cutoff {
                job.reset_to_waiting();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn prune_completed(
        &self,
        queue: QueueName,
        retention: RetentionPolicy,
    ) -> Result<usize, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let mut completed: Vec<(DateTime<Utc>, JobId)> = inner
            .lane(queue)
            .filter(|j| j.status == JobStatus::Completed)
            .map(|j| (j.updated_at, j.id))
            .collect();

        let doomed: Vec<JobId> = match retention {
            RetentionPolicy::KeepAll => Vec::new(),
            RetentionPolicy::KeepLast(n) => {
                completed.sort_by(|a, b| b.0.cmp(&a.0));
                completed.into_iter().skip(n).map(|(_, id)| id).collect()
            }
            RetentionPolicy::MaxAge(age) => {
                let cutoff =
                    Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
                completed
                    .into_iter()
                    .filter(|(at, _)| *at < cutoff)
                    .map(|(_, id)| id)
                    .collect()
            }
        };

        for id in &doomed {
            inner.jobs.remove(id);
        }
        Ok(doomed.len())
    }

    async fn retry_failed(&self, queue: QueueName, id: JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| j.queue == queue)
            .ok_or(JobStoreError::NotFound(id))?;

        if job.status != JobStatus::Failed {
            return Err(JobStoreError::InvalidState {
                id,
                status: job.status,
                expected: JobStatus::Failed,
            });
        }

        job.attempt = 0;
        job.last_error = None;
        job.history.clear();
        job.reset_to_waiting();
        let job = job.clone();

        if let Some(key) = &job.dedupe_key {
            inner.dedupe.entry((queue, key.clone())).or_insert(job.id);
        }
        Ok(job)
    }

    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let now = Utc::now();
        let mut stats = JobStats::default();
        for job in inner.lane(queue) {
            stats.count(job.effective_status(now));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::jobs::types::RetryPolicy;

    fn job(queue: QueueName) -> Job {
        Job::new(queue, serde_json::json!({}))
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let queued = job(QueueName::StatusUpdate);
        let id = queued.id;
        store.enqueue(queued).await.unwrap();

        let claimed = store.claim_next(QueueName::StatusUpdate).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempt, 1);

        assert!(store.claim_next(QueueName::StatusUpdate).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lanes_are_isolated() {
        let store = InMemoryJobStore::new();
        store.enqueue(job(QueueName::Email)).await.unwrap();
        assert!(store.claim_next(QueueName::Notification).await.unwrap().is_none());
        assert!(store.claim_next(QueueName::Email).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimed_early() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(job(QueueName::Reminder).delayed(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(store.claim_next(QueueName::Reminder).await.unwrap().is_none());
        assert!(store.next_run_at(QueueName::Reminder).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn same_key_replaces_pending_job() {
        let store = InMemoryJobStore::new();
        let first = job(QueueName::StatusUpdate)
            .with_dedupe_key("c1-ongoing")
            .delayed(Duration::from_secs(60));
        let first_id = first.id;
        let second = job(QueueName::StatusUpdate)
            .with_dedupe_key("c1-ongoing")
            .delayed(Duration::from_secs(120));
        let second_id = second.id;

        assert_eq!(store.enqueue(first).await.unwrap(), None);
        assert_eq!(store.enqueue(second).await.unwrap(), Some(first_id));

        let stats = store.stats(QueueName::StatusUpdate).await.unwrap();
        assert_eq!(stats.delayed, 1);
        let live = store.live_job(QueueName::StatusUpdate, "c1-ongoing").await.unwrap().unwrap();
        assert_eq!(live.id, second_id);
    }

    #[tokio::test]
    async fn active_job_is_not_replaced() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(job(QueueName::StatusUpdate).with_dedupe_key("k"))
            .await
            .unwrap();
        let running = store.claim_next(QueueName::StatusUpdate).await.unwrap().unwrap();

        let replaced = store
            .enqueue(job(QueueName::StatusUpdate).with_dedupe_key("k"))
            .await
            .unwrap();
        assert_eq!(replaced, None);
        assert_eq!(
            store.get(QueueName::StatusUpdate, running.id).await.unwrap().unwrap().status,
            JobStatus::Active
        );
        assert_eq!(store.stats(QueueName::StatusUpdate).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_when_absent_or_running() {
        let store = InMemoryJobStore::new();
        assert!(!store.cancel(QueueName::StatusUpdate, "missing").await.unwrap());

        store
            .enqueue(job(QueueName::StatusUpdate).with_dedupe_key("k"))
            .await
            .unwrap();
        store.claim_next(QueueName::StatusUpdate).await.unwrap();
        assert!(!store.cancel(QueueName::StatusUpdate, "k").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_removes_pending_job() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(
                job(QueueName::StatusUpdate)
                    .with_dedupe_key("k")
                    .delayed(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        assert!(store.cancel(QueueName::StatusUpdate, "k").await.unwrap());
        assert_eq!(store.stats(QueueName::StatusUpdate).await.unwrap(), JobStats::default());
    }

    #[tokio::test]
    async fn failed_jobs_are_retained_and_retryable() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(job(QueueName::Email).with_retry_policy(RetryPolicy::no_retry()))
            .await
            .unwrap();
        let mut claimed = store.claim_next(QueueName::Email).await.unwrap().unwrap();
        claimed.mark_failed("smtp down".into(), Utc::now());
        store.update(&claimed).await.unwrap();

        let failed = store.list(QueueName::Email, Some(JobStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);

        let retried = store.retry_failed(QueueName::Email, claimed.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Waiting);
        assert_eq!(retried.attempt, 0);
        assert!(matches!(
            store.retry_failed(QueueName::Email, claimed.id).await,
            Err(JobStoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn stalled_jobs_are_requeued() {
        let store = InMemoryJobStore::new();
        store.enqueue(job(QueueName::Notification)).await.unwrap();
        store.claim_next(QueueName::Notification).await.unwrap();

        let recovered = store
            .requeue_stalled(QueueName::Notification, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        assert!(store.claim_next(QueueName::Notification).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn keep_last_prunes_oldest_completed() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.enqueue(job(QueueName::Email)).await.unwrap();
            let mut claimed = store.claim_next(QueueName::Email).await.unwrap().unwrap();
            claimed.mark_completed(Utc::now());
            store.update(&claimed).await.unwrap();
        }

        let pruned = store
            .prune_completed(QueueName::Email, RetentionPolicy::KeepLast(1))
            .await
            .unwrap();
        assert_eq!(pruned, 2);
        assert_eq!(store.stats(QueueName::Email).await.unwrap().completed, 1);
    }
}
