//! Core data models for the edge relay.
//!
//! `StoredObject` maps to the `stored_objects` table via `sqlx::FromRow`;
//! the probe and monitor types are transient and never persisted.

pub mod cache_status;
pub mod monitor_task;
pub mod stored_object;
