//! Observability setup for Loom: tracing subscriber and optional
//! OpenTelemetry export.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
