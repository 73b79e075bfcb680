//! The CDN reconciliation and delivery subsystem.

pub mod cache_monitor;
pub mod cdn_probe;
pub mod delivery_router;
pub mod object_store;
pub mod origin_streamer;
pub mod relay_service;
