//! Represents an uploaded asset fronted by the CDN.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::time::Duration;

/// Handle on the blob provider's copy of an object.
///
/// `file_id` is stable; `file_path` is the last path the provider handed out
/// and may go stale at any time.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct StorageRef {
    pub file_id: String,
    pub file_path: String,
}

/// A single uploaded object and its edge-cache bookkeeping.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Opaque external handle. Never decoded, never changes.
    pub id: String,

    #[sqlx(flatten)]
    pub storage: StorageRef,

    pub file_size: i64,
    pub mime_type: Option<String>,
    pub original_filename: Option<String>,

    /// Immutable; drives the redirect grace window.
    pub uploaded_at: DateTime<Utc>,

    /// `W/"{id}-{size}"`, stable for the object's lifetime.
    pub etag: String,

    /// Monotone: only ever moves from false to true.
    pub cdn_cached: bool,
    pub cdn_cache_time: Option<DateTime<Utc>>,

    pub access_count: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl StoredObject {
    /// Weak validator derived from the id and size.
    pub fn etag_for(id: &str, file_size: i64) -> String {
        format!("W/\"{}-{}\"", id, file_size)
    }

    /// Time since upload. Clock skew into the future counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.uploaded_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn within_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.age(now) < grace
    }
}

/// A completed upload handed over by the ingestion path.
#[derive(Deserialize, Clone, Debug)]
pub struct NewObject {
    pub file_id: String,
    pub file_path: String,
    #[serde(default)]
    pub file_size: i64,
    pub mime_type: Option<String>,
    pub original_filename: Option<String>,
}
