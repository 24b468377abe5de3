//! Lifecycle event publishing.
//!
//! The orchestrator and circuit breaker only ever publish through
//! [`EventSink`]; delivery to clients belongs to whoever subscribes.

pub mod bus;

pub use bus::{EventBus, EventSink, NullSink};
