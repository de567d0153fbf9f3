//! Publish/subscribe events for orchestration sessions
//!
//! Every component publishes into one [`EventBus`]; consumers subscribe to
//! plain broadcast receivers, optionally filtered by run or event type.

pub mod bus;
pub mod types;

pub use bus::{
    EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus, CHANNEL_CAPACITY,
    REPLAY_CAPACITY,
};
pub use types::OrchestraEvent;
