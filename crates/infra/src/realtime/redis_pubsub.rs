//! Redis pub/sub real-time channel.
//!
//! Pub/sub is not durable: a gateway that is not subscribed when an event is
//! published never sees it. Clients recover by reading persisted notifications.

use classrep_core::UserId;
use classrep_events::{RealtimeChannel, RealtimeError, RealtimeEvent};
use redis::aio::ConnectionManager;
use serde_json::Value as JsonValue;
use tracing::debug;

/// Publishes [`RealtimeEvent`]s as JSON on one Redis channel.
#[derive(Clone)]
pub struct RedisRealtimeChannel {
    conn: ConnectionManager,
    channel: String,
}

impl std::fmt::Debug for RedisRealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRealtimeChannel")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

fn unavailable(e: redis::RedisError) -> RealtimeError {
    RealtimeError::Unavailable(e.to_string())
}

impl RedisRealtimeChannel {
    pub async fn connect(redis_url: &str, channel: impl Into<String>) -> Result<Self, RealtimeError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self::with_connection(conn, channel))
    }

    pub fn with_connection(conn: ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            conn,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

fn encode(user_id: UserId, event: &str, payload: JsonValue) -> Result<String, RealtimeError> {
    Ok(serde_json::to_string(&RealtimeEvent::new(user_id, event, payload))?)
}

#[async_trait::async_trait]
impl RealtimeChannel for RedisRealtimeChannel {
    async fn emit_to_user(
        &self,
        user_id: UserId,
        event: &str,
        payload: JsonValue,
    ) -> Result<(), RealtimeError> {
        let message = encode(user_id, event, payload)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        debug!(user_id = %user_id, event, receivers, "realtime event published");
        Ok(())
    }
}
