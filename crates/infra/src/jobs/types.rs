//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

/// Named lane. Each lane has its own consumer loop and concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// Time-driven entity status transitions.
    StatusUpdate,
    /// Notification fan-out.
    Notification,
    /// Deadline reminders.
    Reminder,
    /// Outbound email delivery.
    Email,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::StatusUpdate,
        QueueName::Notification,
        QueueName::Reminder,
        QueueName::Email,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::StatusUpdate => "status-update",
            QueueName::Notification => "notification",
            QueueName::Reminder => "reminder",
            QueueName::Email => "email",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {s}"))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Due now, waiting for a consumer.
    Waiting,
    /// Due in the future (initial delay or retry backoff).
    Delayed,
    /// Claimed by a consumer.
    Active,
    /// Finished successfully; pruned per retention.
    Completed,
    /// Retries exhausted; retained for inspection.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Waiting or Delayed: may still be replaced or cancelled.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5000),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic pseudo-jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// How many completed jobs a lane keeps around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    KeepAll,
    KeepLast(usize),
    MaxAge(Duration),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::KeepLast(1000)
    }
}

/// Options for [`crate::jobs::JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Zero or absent means "due now".
    pub delay: Option<Duration>,
    /// At most one pending job per key per lane; a newer enqueue replaces it.
    pub dedupe_key: Option<String>,
    /// Lane default when absent.
    pub retry_policy: Option<RetryPolicy>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Returned by enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: QueueName,
    pub run_at: DateTime<Utc>,
    /// Id of a pending job with the same dedupe key that this one replaced.
    pub replaced: Option<JobId>,
}

/// A queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    /// Opaque to the queue; decoded by the lane's handler.
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

impl Job {
    pub fn new(queue: QueueName, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue,
            payload,
            dedupe_key: None,
            status: JobStatus::Waiting,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            run_at: now,
            last_error: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Delay the first run. A zero delay keeps the job Waiting.
    pub fn delayed(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.run_at = self.created_at + chrono_delay(delay);
            self.status = JobStatus::Delayed;
        }
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_pending() && self.run_at <= now
    }

    pub fn mark_active(&mut self) {
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.last_error = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Record a failed attempt and either schedule a retry or fail terminally.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error.clone()),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
        self.last_error = Some(error);

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.run_at = now + chrono_delay(delay);
            self.status = JobStatus::Delayed;
        } else {
            self.status = JobStatus::Failed;
        }
    }

    /// Put a stalled or failed job back in line, due now.
    pub fn reset_to_waiting(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Waiting;
        self.run_at = now;
        self.updated_at = now;
    }

    /// Status a pending job has at `now` (Delayed jobs become Waiting once due).
    pub fn effective_status(&self, now: DateTime<Utc>) -> JobStatus {
        match self.status {
            JobStatus::Delayed if self.run_at <= now => JobStatus::Waiting,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_matches_lane_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(20_000));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(500));
    }

    #[test]
    fn fixed_backoff_ignores_attempt() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn three_attempts_then_failed() {
        let mut job = Job::new(QueueName::StatusUpdate, serde_json::json!({}));
        assert_eq!(job.status, JobStatus::Waiting);

        for expected in [JobStatus::Delayed, JobStatus::Delayed, JobStatus::Failed] {
            job.mark_active();
            job.mark_failed("boom".into(), Utc::now());
            assert_eq!(job.status, expected);
        }
        assert_eq!(job.attempt, 3);
        assert_eq!(job.history.len(), 3);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn zero_delay_stays_waiting() {
        let job = Job::new(QueueName::Email, serde_json::json!({})).delayed(Duration::ZERO);
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn delayed_job_is_not_ready_early() {
        let job = Job::new(QueueName::Email, serde_json::json!({}))
            .delayed(Duration::from_secs(60));
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_ready(Utc::now()));
        assert_eq!(job.effective_status(job.run_at), JobStatus::Waiting);
    }

    #[test]
    fn queue_names_round_trip() {
        for q in QueueName::ALL {
            assert_eq!(q.as_str().parse::<QueueName>().unwrap(), q);
        }
        let json = serde_json::to_string(&QueueName::StatusUpdate).unwrap();
        assert_eq!(json, "\"status-update\"");
    }

    proptest! {
        #[test]
        fn exponential_delay_is_monotonic_and_bounded(attempt in 1u32..40) {
            let policy = RetryPolicy::default();
            let this = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(this <= next);
            prop_assert!(next <= policy.max_delay);
        }
    }
}
