//! Per-service circuit breaking.
//!
//! - `circuit_breaker` -- transition rules and the store-backed [`CircuitBreaker`]
//! - `store` -- the [`CircuitStateStore`] port and its in-memory implementation

pub mod circuit_breaker;
pub mod store;

pub use circuit_breaker::{CircuitBreaker, CircuitError};
pub use store::{CircuitStateStore, InMemoryCircuitStore};
