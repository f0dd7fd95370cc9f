//! Real-time event distribution.
//!
//! - [`bus`]: publish/subscribe mechanics, transport-agnostic.
//! - [`in_memory_bus`]: in-process bus for tests and single-node dev runs.
//! - [`realtime`]: per-user real-time events (`emit_to_user`) layered on a bus.

pub mod bus;
pub mod in_memory_bus;
pub mod realtime;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use realtime::{BusRealtimeChannel, RealtimeChannel, RealtimeError, RealtimeEvent};
