//! Job producer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, instrument};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{EnqueueOptions, Job, JobHandle, JobId, JobStatus, QueueName, RetryPolicy};

/// Error returned by [`JobQueue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to encode job payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Cloneable handle for enqueueing and inspecting jobs.
///
/// Enqueues wake the matching lane's consumer in this process immediately;
/// other processes pick new jobs up on their next poll.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    signals: Arc<HashMap<QueueName, Arc<Notify>>>,
    default_retry: RetryPolicy,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("default_retry", &self.default_retry)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let signals = QueueName::ALL
            .into_iter()
            .map(|q| (q, Arc::new(Notify::new())))
            .collect();
        Self {
            store,
            signals: Arc::new(signals),
            default_retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for jobs enqueued without an explicit one.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub(crate) fn signal(&self, queue: QueueName) -> Arc<Notify> {
        self.signals
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    #[instrument(
        skip(self, payload, options),
        fields(queue = %queue, dedupe_key = options.dedupe_key.as_deref().unwrap_or("")),
        err
    )]
    pub async fn enqueue<P>(
        &self,
        queue: QueueName,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<JobHandle, QueueError>
    where
        P: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        let mut job = Job::new(queue, payload)
            .with_retry_policy(options.retry_policy.unwrap_or_else(|| self.default_retry.clone()))
            .delayed(options.delay.unwrap_or(Duration::ZERO));
        if let Some(key) = options.dedupe_key {
            job = job.with_dedupe_key(key);
        }

        let handle = JobHandle {
            id: job.id,
            queue,
            run_at: job.run_at,
            replaced: None,
        };
        let replaced = self.store.enqueue(job).await?;
        self.signal(queue).notify_one();

        debug!(job_id = %handle.id, run_at = %handle.run_at, replaced = ?replaced, "job enqueued");
        Ok(JobHandle { replaced, ..handle })
    }

    /// Best-effort removal of the pending job for `dedupe_key`.
    #[instrument(skip(self), fields(queue = %queue), err)]
    pub async fn cancel(&self, queue: QueueName, dedupe_key: &str) -> Result<bool, QueueError> {
        Ok(self.store.cancel(queue, dedupe_key).await?)
    }

    pub async fn get(&self, queue: QueueName, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(queue, id).await?)
    }

    pub async fn list(
        &self,
        queue: QueueName,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(queue, status, limit).await?)
    }

    pub async fn live_job(&self, queue: QueueName, dedupe_key: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.store.live_job(queue, dedupe_key).await?)
    }

    pub async fn stats(&self, queue: QueueName) -> Result<JobStats, QueueError> {
        Ok(self.store.stats(queue).await?)
    }

    /// Re-run a job whose retries were exhausted.
    #[instrument(skip(self), fields(queue = %queue, job_id = %id), err)]
    pub async fn retry_failed(&self, queue: QueueName, id: JobId) -> Result<Job, QueueError> {
        let job = self.store.retry_failed(queue, id).await?;
        self.signal(queue).notify_one();
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    #[tokio::test]
    async fn enqueue_reports_replacement() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let opts = || {
            EnqueueOptions::new()
                .delay(Duration::from_secs(600))
                .dedupe_key("a1-active")
        };

        let first = queue.enqueue(QueueName::StatusUpdate, &1, opts()).await.unwrap();
        let second = queue.enqueue(QueueName::StatusUpdate, &2, opts()).await.unwrap();

        assert_eq!(first.replaced, None);
        assert_eq!(second.replaced, Some(first.id));
        let stats = queue.stats(QueueName::StatusUpdate).await.unwrap();
        assert_eq!(stats.delayed, 1);

        let live = queue
            .live_job(QueueName::StatusUpdate, "a1-active")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.payload, serde_json::json!(2));
    }

    #[tokio::test]
    async fn default_retry_applies_when_unspecified() {
        let policy = RetryPolicy::fixed(7, Duration::from_millis(10));
        let queue = JobQueue::new(InMemoryJobStore::arc()).with_default_retry(policy.clone());

        let handle = queue
            .enqueue(QueueName::Email, "hello", EnqueueOptions::new())
            .await
            .unwrap();
        let job = queue.get(QueueName::Email, handle.id).await.unwrap().unwrap();
        assert_eq!(job.retry_policy, policy);
        assert_eq!(job.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn cancel_unknown_key_is_a_no_op() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        assert!(!queue.cancel(QueueName::Reminder, "nope").await.unwrap());
    }
}
