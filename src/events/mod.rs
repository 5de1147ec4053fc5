//! Event Bus (spec §4.1): bounded pub/sub fan-out for every state
//! transition in the system.

mod bus;
mod types;

pub use bus::{EventBus, EventSubscriber, create_event_bus};
pub use types::{Event, EventEnvelope, Severity};
