//! SQLite storage layer.
//!
//! Store implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod circuit_state;
pub mod history;
pub mod pool;

pub use circuit_state::SqliteCircuitStateStore;
pub use history::SqliteExecutionHistory;
pub use pool::{DatabasePool, database_url_in};
