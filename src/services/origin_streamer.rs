//! Origin Streamer: serves an object straight from the blob provider.
//!
//! Every direct serve re-resolves the provider path, because provider paths
//! expire without notice. The body is streamed through chunk by chunk and
//! `Range` requests are passed upstream untouched.

use crate::{
    config::CdnConfig,
    models::stored_object::StoredObject,
    services::object_store::{SharedResolver, SharedStore, StoreError},
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";
const ACCESS_TYPE_HEADER: &str = "x-access-type";

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("upstream path for `{0}` could not be refreshed")]
    PathUnavailable(String),
    #[error("upstream answered {status} for `{id}`")]
    UpstreamStatus { id: String, status: u16 },
    #[error("upstream fetch failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServeError::NotFound(id),
            other => ServeError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    CdnPull,
    DirectAccess,
}

impl AccessType {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessType::CdnPull => "cdn_pull",
            AccessType::DirectAccess => "direct_access",
        }
    }
}

/// The parts of an inbound request the streamer cares about.
#[derive(Debug, Clone)]
pub struct DirectRequest {
    pub head_only: bool,
    pub if_none_match: Option<String>,
    pub range: Option<String>,
    pub access_type: AccessType,
}

#[derive(Clone)]
pub struct OriginStreamer {
    cfg: CdnConfig,
    store: SharedStore,
    resolver: SharedResolver,
    client: reqwest::Client,
}

impl OriginStreamer {
    pub fn new(
        cfg: CdnConfig,
        store: SharedStore,
        resolver: SharedResolver,
        fetch_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        // Bounds connect and every read, not the whole transfer.
        let client = reqwest::Client::builder()
            .connect_timeout(fetch_timeout)
            .read_timeout(fetch_timeout)
            .build()?;
        Ok(Self {
            cfg,
            store,
            resolver,
            client,
        })
    }

    /// `Cache-Control` for an object of this age.
    ///
    /// Fresh uploads get a short lifetime so intermediate caches re-check
    /// soon; everything else is immutable for a long time.
    pub fn cache_control(&self, object: &StoredObject, now: DateTime<Utc>) -> String {
        if !self.cfg.enabled {
            "public, max-age=3600".to_string()
        } else if object.within_grace(now, self.cfg.grace_window) {
            "public, max-age=300, s-maxage=300".to_string()
        } else {
            format!(
                "public, max-age={}, s-maxage={}, immutable",
                self.cfg.cache_ttl_secs, self.cfg.edge_ttl_secs
            )
        }
    }

    pub async fn serve(
        &self,
        object: &StoredObject,
        request: &DirectRequest,
        now: DateTime<Utc>,
    ) -> Result<Response, ServeError> {
        let cache_control = self.cache_control(object, now);

        if etag_matches(request.if_none_match.as_deref(), &object.etag) {
            self.record_access(&object.id).await;
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            let headers = response.headers_mut();
            insert(headers, header::ETAG, &object.etag);
            insert(headers, header::CACHE_CONTROL, &cache_control);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
            return Ok(response);
        }

        let fresh_path = self
            .resolver
            .refresh_path(&object.storage.file_id)
            .await
            .map_err(|err| {
                warn!("could not refresh file path for {}: {}", object.id, err);
                ServeError::PathUnavailable(object.id.clone())
            })?;

        if fresh_path != object.storage.file_path {
            if let Err(err) = self.store.update_path(&object.id, &fresh_path).await {
                warn!("failed to persist refreshed path for {}: {}", object.id, err);
            }
        }

        let mut upstream = self.client.get(self.resolver.file_url(&fresh_path));
        if let Some(range) = &request.range {
            upstream = upstream.header(header::RANGE, range);
        }
        info!(
            "fetching {} from upstream ({})",
            object.id,
            request.access_type.as_str()
        );
        let upstream = upstream.send().await?;

        let status = upstream.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::PARTIAL_CONTENT {
            warn!("upstream fetch for {} failed with {}", object.id, status);
            return Err(ServeError::UpstreamStatus {
                id: object.id.clone(),
                status: status.as_u16(),
            });
        }

        self.record_access(&object.id).await;

        let upstream_headers = upstream.headers().clone();
        let body = if request.head_only {
            Body::empty()
        } else {
            Body::from_stream(upstream.bytes_stream())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        let headers = response.headers_mut();

        let content_type = object
            .mime_type
            .clone()
            .or_else(|| {
                upstream_headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.into());
        insert(headers, header::CONTENT_TYPE, &content_type);
        for name in [header::CONTENT_LENGTH, header::CONTENT_RANGE] {
            if let Some(value) = upstream_headers.get(&name) {
                headers.insert(name, value.clone());
            }
        }

        insert(headers, header::ETAG, &object.etag);
        insert(headers, header::CACHE_CONTROL, &cache_control);
        insert(
            headers,
            header::CONTENT_DISPOSITION,
            &format!("inline; filename=\"{}\"", download_name(object, &fresh_path)),
        );
        insert(
            headers,
            header::LAST_MODIFIED,
            &object
                .uploaded_at
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        );
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(
            HeaderName::from_static(ACCESS_TYPE_HEADER),
            HeaderValue::from_static(request.access_type.as_str()),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges, ETag"),
        );
        if self.cfg.is_active() {
            headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
            let prefix: String = object.id.chars().take(8).collect();
            insert(
                headers,
                HeaderName::from_static("cf-cache-tag"),
                &format!("image-{},imagebed,static", prefix),
            );
        }

        Ok(response)
    }

    async fn record_access(&self, id: &str) {
        if let Err(err) = self.store.record_access(id).await {
            warn!("failed to record access for {}: {}", id, err);
        }
    }
}

/// `If-None-Match` may carry a list; any exact entry (or `*`) matches.
fn etag_matches(if_none_match: Option<&str>, etag: &str) -> bool {
    if_none_match.is_some_and(|value| {
        value
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == etag || candidate == "*")
    })
}

fn download_name(object: &StoredObject, path: &str) -> String {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg");
    let prefix: String = object.id.chars().take(12).collect();
    format!("image_{}.{}", prefix, ext)
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
