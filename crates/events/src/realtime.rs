//! Per-user real-time events.
//!
//! The socket layer that actually pushes to connected clients is outside this
//! workspace; it consumes [`RealtimeEvent`]s from whichever transport the
//! channel publishes to (in-process bus, Redis pub/sub).

use chrono::{DateTime, Utc};
use classrep_core::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::bus::EventBus;

/// Event addressed to every session of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// Socket room, `user:{id}`.
    pub room: String,
    pub user_id: UserId,
    /// Event name, e.g. `notification`.
    pub event: String,
    pub payload: JsonValue,
    pub emitted_at: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(user_id: UserId, event: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            room: format!("user:{user_id}"),
            user_id,
            event: event.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime transport unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode realtime event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fire-and-forget delivery to a user's live sessions.
///
/// Callers bound the call with a timeout and only log failures; a missed
/// real-time event is recovered by the client reading persisted notifications.
#[async_trait::async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn emit_to_user(
        &self,
        user_id: UserId,
        event: &str,
        payload: JsonValue,
    ) -> Result<(), RealtimeError>;
}

/// [`RealtimeChannel`] that publishes onto any [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusRealtimeChannel<B> {
    bus: B,
}

impl<B> BusRealtimeChannel<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

#[async_trait::async_trait]
impl<B> RealtimeChannel for BusRealtimeChannel<B>
where
    B: EventBus<RealtimeEvent> + 'static,
{
    async fn emit_to_user(
        &self,
        user_id: UserId,
        event: &str,
        payload: JsonValue,
    ) -> Result<(), RealtimeError> {
        let message = RealtimeEvent::new(user_id, event, payload);
        self.bus
            .publish(message)
            .map_err(|e| RealtimeError::Unavailable(e.to_string()))?;
        tracing::debug!(user_id = %user_id, event, "realtime event published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::in_memory_bus::InMemoryEventBus;

    #[tokio::test]
    async fn emit_targets_the_user_room() {
        let bus = Arc::new(InMemoryEventBus::<RealtimeEvent>::new());
        let sub = bus.subscribe();
        let channel = BusRealtimeChannel::new(bus.clone());
        let user = UserId::new();

        channel
            .emit_to_user(user, "notification", serde_json::json!({ "title": "hi" }))
            .await
            .unwrap();

        let got = sub.try_recv().unwrap();
        assert_eq!(got.room, format!("user:{user}"));
        assert_eq!(got.event, "notification");
        assert_eq!(got.payload["title"], "hi");
    }
}
