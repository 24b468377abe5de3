//! Shared domain types for the Loom workflow engine.
//!
//! Workflow definitions, circuit state, usage and blast-radius records,
//! optimization and replay results, lifecycle events and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, semver, thiserror.

pub mod circuit;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod optimization;
pub mod usage;
pub mod workflow;
