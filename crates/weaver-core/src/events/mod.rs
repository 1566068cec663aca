//! Event vocabulary and live fan-out
//!
//! Every state transition in the engine leaves as an event. The `EventBus`
//! delivers events to live subscribers and hands the persistable ones to the
//! `EventStore`, which assigns per-session sequence numbers.

mod bus;
mod types;

pub use bus::{EventBus, EventSubscription};
pub use types::{
    should_store, split_event, DomainEvent, EventEnvelope, EventSource, EventType, SessionEvent,
    PERSISTED_EVENT_TYPES,
};
