//! Domain events and the append-only store that orders them.

mod event;
mod store;

pub use event::{
    AggregateType, DomainEvent, EventPayload, EventType, NewEvent, RequestContext,
    EVENT_VERSION, SYSTEM_ACTOR,
};
pub use store::EventStore;
