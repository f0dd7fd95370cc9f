//! Process configuration loaded from environment variables.
//!
//! | Variable                     | Default                              |
//! |------------------------------|--------------------------------------|
//! | `DATABASE_URL`               | required                             |
//! | `DATABASE_MAX_CONNECTIONS`   | `10`                                 |
//! | `REDIS_URL`                  | unset                                |
//! | `QUEUE_BACKEND`              | `redis` if `REDIS_URL` set, else `memory` |
//! | `QUEUE_PREFIX`               | `classrep`                           |
//! | `JOB_MAX_ATTEMPTS`           | `3`                                  |
//! | `JOB_BACKOFF_BASE_MS`        | `5000`                               |
//! | `JOB_BACKOFF_MAX_MS`         | `300000`                             |
//! | `WORKER_POLL_INTERVAL_MS`    | `1000`                               |
//! | `JOB_TIMEOUT_SECS`           | `60`                                 |
//! | `JOB_STALL_TIMEOUT_SECS`     | `300`                                |
//! | `COMPLETED_JOB_RETENTION`    | `1000`                               |
//! | `STATUS_UPDATE_CONCURRENCY`  | `5`                                  |
//! | `NOTIFICATION_CONCURRENCY`   | `10`                                 |
//! | `REMINDER_CONCURRENCY`       | `5`                                  |
//! | `EMAIL_CONCURRENCY`          | `5`                                  |
//! | `RECONCILE_ON_START`         | `true`                               |
//! | `RECONCILE_FAN_OUT`          | `16`                                 |
//! | `RECONCILE_CATCH_UP`         | `true`                               |
//! | `REMINDER_LEAD_MINUTES`      | `60` (`0` disables reminders)        |
//! | `EXTERNAL_CALL_TIMEOUT_MS`   | `5000`                               |
//! | `MAIL_API_URL`, `MAIL_API_KEY`, `MAIL_FROM` | unset (log-only mailer) |
//!
//! `LOG_FORMAT` and `RUST_LOG` are read by `classrep-observability`.

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{LaneConfig, QueueName, RetentionPolicy, RetryPolicy};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Job store backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    Redis,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(QueueBackend::Memory),
            "redis" => Ok(QueueBackend::Redis),
            other => Err(format!("expected `memory` or `redis`, got `{other}`")),
        }
    }
}

/// HTTP mail API credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

impl std::fmt::Debug for MailSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailSettings")
            .field("api_url", &self.api_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

/// Per-lane concurrency limits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LaneConcurrency {
    pub status_update: usize,
    pub notification: usize,
    pub reminder: usize,
    pub email: usize,
}

impl LaneConcurrency {
    pub fn for_queue(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::StatusUpdate => self.status_update,
            QueueName::Notification => self.notification,
            QueueName::Reminder => self.reminder,
            QueueName::Email => self.email,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub queue_backend: QueueBackend,
    pub queue_prefix: String,
    pub job_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub stall_timeout: Duration,
    pub completed_retention: usize,
    pub concurrency: LaneConcurrency,
    pub reconcile_on_start: bool,
    pub reconcile_fan_out: usize,
    pub reconcile_catch_up: bool,
    /// `None` disables deadline reminders.
    pub reminder_lead: Option<Duration>,
    pub external_call_timeout: Duration,
    pub mail: Option<MailSettings>,
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn positive(&self, name: &'static str, default: u64) -> Result<u64, ConfigError> {
        let value = self.parse(name, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                name,
                value: value.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    fn count(&self, name: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value = self.positive(name, default as u64)?;
        usize::try_from(value).map_err(|e| ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let database_url = env.get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let redis_url = env.get("REDIS_URL");
        let default_backend = if redis_url.is_some() {
            QueueBackend::Redis
        } else {
            QueueBackend::Memory
        };
        let queue_backend = env.parse("QUEUE_BACKEND", default_backend)?;
        if queue_backend == QueueBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        let mail = match (env.get("MAIL_API_URL"), env.get("MAIL_API_KEY")) {
            (Some(api_url), Some(api_key)) => Some(MailSettings {
                api_url,
                api_key,
                from: env
                    .get("MAIL_FROM")
                    .ok_or(ConfigError::Missing("MAIL_FROM"))?,
            }),
            (Some(_), None) => return Err(ConfigError::Missing("MAIL_API_KEY")),
            _ => None,
        };

        let reminder_minutes: u64 = env.parse("REMINDER_LEAD_MINUTES", 60)?;

        Ok(Self {
            database_url,
            database_max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url,
            queue_backend,
            queue_prefix: env.get("QUEUE_PREFIX").unwrap_or_else(|| "classrep".into()),
            job_max_attempts: env.positive("JOB_MAX_ATTEMPTS", 3)? as u32,
            backoff_base: Duration::from_millis(env.parse("JOB_BACKOFF_BASE_MS", 5_000)?),
            backoff_max: Duration::from_millis(env.parse("JOB_BACKOFF_MAX_MS", 300_000)?),
            poll_interval: Duration::from_millis(env.positive("WORKER_POLL_INTERVAL_MS", 1_000)?),
            job_timeout: Duration::from_secs(env.positive("JOB_TIMEOUT_SECS", 60)?),
            stall_timeout: Duration::from_secs(env.positive("JOB_STALL_TIMEOUT_SECS", 300)?),
            completed_retention: env.parse("COMPLETED_JOB_RETENTION", 1_000)?,
            concurrency: LaneConcurrency {
                status_update: env.count("STATUS_UPDATE_CONCURRENCY", 5)?,
                notification: env.count("NOTIFICATION_CONCURRENCY", 10)?,
                reminder: env.count("REMINDER_CONCURRENCY", 5)?,
                email: env.count("EMAIL_CONCURRENCY", 5)?,
            },
            reconcile_on_start: env.parse("RECONCILE_ON_START", true)?,
            reconcile_fan_out: env.count("RECONCILE_FAN_OUT", 16)?,
            reconcile_catch_up: env.parse("RECONCILE_CATCH_UP", true)?,
            reminder_lead: (reminder_minutes > 0)
                .then(|| Duration::from_secs(reminder_minutes * 60)),
            external_call_timeout: Duration::from_millis(
                env.positive("EXTERNAL_CALL_TIMEOUT_MS", 5_000)?,
            ),
            mail,
        })
    }

    /// Retry policy applied to every enqueued job.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.job_max_attempts, self.backoff_base, self.backoff_max)
    }

    pub fn lane_config(&self, queue: QueueName) -> LaneConfig {
        LaneConfig::default()
            .with_concurrency(self.concurrency.for_queue(queue))
            .with_poll_interval(self.poll_interval)
            .with_handler_timeout(self.job_timeout)
            .with_stall_timeout(self.stall_timeout)
            .with_retention(RetentionPolicy::KeepLast(self.completed_retention))
    }
}
