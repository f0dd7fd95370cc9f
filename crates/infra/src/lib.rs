//! Infrastructure layer: job queue, Postgres and in-memory adapters, Redis
//! transports, mail delivery and configuration.

pub mod config;
pub mod db;
pub mod jobs;
pub mod mail;
pub mod memory;
pub mod realtime;

pub use config::{ConfigError, QueueBackend, Settings};
pub use mail::{EmailJob, EmailSender, HttpMailer, MailError, Mailer, TracingMailer};
pub use memory::{InMemoryBackend, UserRecord};
