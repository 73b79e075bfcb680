//! Defines the HTTP surface of the relay.
//!
//! ## Structure
//! - **Delivery**
//!   - `GET     /image/{id}` : redirect to the CDN or stream from origin
//!   - `HEAD    /image/{id}` : same decision, headers only
//!   - `OPTIONS /image/{id}` : CORS preflight
//!
//! - **Ingestion**
//!   - `POST    /api/objects` : register a completed upload
//!
//! - **Health**
//!   - `GET     /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{image_options, serve_image},
        object_handlers::register_object,
    },
    services::relay_service::RelayService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all relay routes.
///
/// The router carries shared state (`RelayService`) to all handlers.
pub fn routes() -> Router<RelayService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // delivery (axum answers HEAD through the GET handler)
        .route("/image/{id}", get(serve_image).options(image_options))
        // ingestion
        .route("/api/objects", post(register_object))
}
