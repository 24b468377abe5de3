//! Infrastructure layer for Loom.
//!
//! Implements the ports defined in `loom-core`: SQLite circuit state and run
//! history, file-backed workflow definitions and JSON Schema input
//! validation. `runtime` wires them into a ready-to-use engine.

pub mod config;
pub mod filesystem;
pub mod runtime;
pub mod sqlite;
pub mod validation;
