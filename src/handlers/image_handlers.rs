//! `/image/{id}`: the only public delivery endpoint.
//!
//! All redirect-vs-stream logic lives in `DeliveryRouter`; these handlers only
//! unpack the request and translate failures.

use crate::{errors::AppError, services::relay_service::RelayService};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use tracing::error;

/// `GET`/`HEAD /image/{id}`
pub async fn serve_image(
    State(service): State<RelayService>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    service
        .router
        .route(&id, &method, &uri, &headers)
        .await
        .map_err(|err| {
            error!("serving image {} failed: {}", id, err);
            AppError::from(err)
        })
}

/// `OPTIONS /image/{id}`, the CORS preflight.
pub async fn image_options() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range, Content-Type, Cache-Control"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}
