//! Workflow execution core for Loom.
//!
//! This crate holds every algorithm and defines the "ports" (collaborator
//! traits) that the infrastructure layer implements. It depends only on
//! `loom-types` -- never on `loom-infra` or any database crate.

pub mod analysis;
pub mod event;
pub mod repository;
pub mod resilience;
pub mod workflow;
