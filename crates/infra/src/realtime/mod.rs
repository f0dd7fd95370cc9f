//! Real-time transports for [`classrep_events::RealtimeChannel`].
//!
//! In-process delivery uses `classrep_events::BusRealtimeChannel`; across
//! processes, events are published to Redis for the socket gateway.

#[cfg(feature = "redis")]
mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisRealtimeChannel;

/// Pub/sub channel the socket gateway subscribes to.
pub const DEFAULT_CHANNEL: &str = "classrep:realtime";
