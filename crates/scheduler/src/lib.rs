//! `classrep-scheduler`: delayed status transitions and notification fan-out.
//!
//! ## Lanes and their consumers
//!
//! | lane            | payload                                  | consumer                       |
//! |-----------------|------------------------------------------|--------------------------------|
//! | `status-update` | [`StatusUpdateJob`]                      | [`StatusTransitionExecutor`]   |
//! | `notification`  | [`classrep_core::NotificationJob`]       | [`NotificationDispatcher`]     |
//! | `reminder`      | [`ReminderJob`]                          | [`ReminderHandler`]            |
//! | `email`         | [`classrep_infra::EmailJob`]             | [`classrep_infra::EmailSender`] |
//!
//! [`SchedulingEngine`] wires them together over a shared
//! [`classrep_infra::jobs::JobQueue`].

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod messages;
pub mod notifier;
pub mod payloads;
pub mod reconciler;
pub mod reminder;
pub mod scheduler;
pub mod templates;
pub mod transition;

pub use dispatcher::{FanOutReport, NotificationDispatcher};
pub use engine::{EngineConfig, EnginePorts, SchedulingEngine};
pub use error::SchedulingError;
pub use executor::{ExecutionOutcome, StatusTransitionExecutor};
pub use notifier::Notifier;
pub use payloads::{ReminderJob, StatusUpdateJob};
pub use reconciler::{ReconciliationReport, Reconciler};
pub use reminder::ReminderHandler;
pub use scheduler::{ScheduleOutcome, TransitionScheduler};
pub use transition::{ScheduledTransition, reminder_event_key, transition_key};
