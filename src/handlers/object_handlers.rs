//! Ingestion hook: registers an upload the blob provider already accepted.

use crate::{
    errors::AppError, models::stored_object::NewObject, services::relay_service::RelayService,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RegisteredObject {
    pub id: String,
    pub url: String,
    pub cdn_url: Option<String>,
    pub etag: String,
}

/// `POST /api/objects`
pub async fn register_object(
    State(service): State<RelayService>,
    Json(payload): Json<NewObject>,
) -> Result<impl IntoResponse, AppError> {
    if payload.file_id.trim().is_empty() {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "file_id is required"));
    }

    let object = service.register_object(payload).await?;
    let body = RegisteredObject {
        url: format!("/image/{}", object.id),
        cdn_url: service
            .cdn
            .is_active()
            .then(|| service.cdn.image_url(&object.id)),
        etag: object.etag,
        id: object.id,
    };
    Ok((StatusCode::CREATED, Json(body)))
}
