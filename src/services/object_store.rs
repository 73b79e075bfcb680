//! src/services/object_store.rs
//!
//! Object Store Adapter: the only place that touches persisted
//! `StoredObject` rows or asks the blob provider for a fresh file path.
//! Every operation is a single statement against the pool; nothing here is
//! held open across a network call to the CDN.

use crate::models::stored_object::StoredObject;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const OBJECT_COLUMNS: &str = "id, file_id, file_path, file_size, mime_type, original_filename, \
     uploaded_at, etag, cdn_cached, cdn_cache_time, access_count, last_accessed_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("upstream has no path for file `{0}`")]
    Unavailable(String),
    #[error("upstream path lookup failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Key-value style access to persisted objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, id: &str) -> StoreResult<StoredObject>;

    async fn insert_object(&self, object: &StoredObject) -> StoreResult<()>;

    /// Persist a refreshed provider path.
    async fn update_path(&self, id: &str, file_path: &str) -> StoreResult<()>;

    /// Mark the object as cached at the edge.
    ///
    /// Returns `true` only for the call that actually flipped the flag.
    /// Passing `false` never clears an existing flag.
    async fn update_cache_state(&self, id: &str, cached: bool) -> StoreResult<bool>;

    async fn record_access(&self, id: &str) -> StoreResult<()>;

    /// Uncached objects uploaded after `since`, newest first.
    async fn list_pending_monitoring(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<(String, DateTime<Utc>)>>;
}

pub type SharedStore = Arc<dyn ObjectStore>;

/// SQLite-backed `ObjectStore`.
#[derive(Clone)]
pub struct SqliteObjectStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteObjectStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    async fn get_object(&self, id: &str) -> StoreResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {} FROM stored_objects WHERE id = ?",
            OBJECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn insert_object(&self, object: &StoredObject) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO stored_objects (
                id, file_id, file_path, file_size, mime_type, original_filename,
                uploaded_at, etag, cdn_cached, cdn_cache_time, access_count, last_accessed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&object.id)
        .bind(&object.storage.file_id)
        .bind(&object.storage.file_path)
        .bind(object.file_size)
        .bind(&object.mime_type)
        .bind(&object.original_filename)
        .bind(object.uploaded_at)
        .bind(&object.etag)
        .bind(object.cdn_cached)
        .bind(object.cdn_cache_time)
        .bind(object.access_count)
        .bind(object.last_accessed_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn update_path(&self, id: &str, file_path: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE stored_objects SET file_path = ?, path_updated_at = ? WHERE id = ?",
        )
        .bind(file_path)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        debug!("updated file_path for {} -> {}", id, file_path);
        Ok(())
    }

    async fn update_cache_state(&self, id: &str, cached: bool) -> StoreResult<bool> {
        if !cached {
            debug!("ignoring request to clear cdn_cached for {}", id);
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE stored_objects SET cdn_cached = 1, cdn_cache_time = ?
             WHERE id = ? AND cdn_cached = 0",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 1 {
            info!("object {} is now cached at the edge", id);
            return Ok(true);
        }

        // Either already cached or missing entirely.
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT cdn_cached FROM stored_objects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn record_access(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE stored_objects
             SET access_count = access_count + 1, last_accessed_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_pending_monitoring(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<(String, DateTime<Utc>)>> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>)>(
            "SELECT id, uploaded_at FROM stored_objects
             WHERE cdn_cached = 0 AND uploaded_at > ?
             ORDER BY uploaded_at DESC
             LIMIT ?",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }
}

/// Apply the embedded schema one statement at a time.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

/// Turns a stable provider file id into a currently valid download path.
#[async_trait]
pub trait PathResolver: Send + Sync {
    async fn refresh_path(&self, file_id: &str) -> Result<String, ResolveError>;

    /// Absolute URL the streamer should fetch for `path`.
    fn file_url(&self, path: &str) -> String;
}

pub type SharedResolver = Arc<dyn PathResolver>;

/// `PathResolver` backed by the Telegram Bot API `getFile` call.
#[derive(Clone)]
pub struct TelegramPathResolver {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

#[derive(Deserialize)]
struct GetFileResponse {
    ok: bool,
    result: Option<GetFileResult>,
}

#[derive(Deserialize)]
struct GetFileResult {
    file_path: Option<String>,
}

impl TelegramPathResolver {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        })
    }
}

#[async_trait]
impl PathResolver for TelegramPathResolver {
    async fn refresh_path(&self, file_id: &str) -> Result<String, ResolveError> {
        if self.bot_token.is_empty() || file_id.is_empty() {
            return Err(ResolveError::Unavailable(file_id.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/bot{}/getFile", self.api_base, self.bot_token))
            .query(&[("file_id", file_id)])
            .send()
            .await?;

        if !response.status().is_success() {
            debug!(
                "getFile for {} answered with status {}",
                file_id,
                response.status()
            );
            return Err(ResolveError::Unavailable(file_id.to_string()));
        }

        let body: GetFileResponse = response.json().await?;
        match body {
            GetFileResponse {
                ok: true,
                result:
                    Some(GetFileResult {
                        file_path: Some(path),
                    }),
            } if !path.is_empty() => Ok(path),
            _ => Err(ResolveError::Unavailable(file_id.to_string())),
        }
    }

    fn file_url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!(
                "{}/file/bot{}/{}",
                self.api_base,
                self.bot_token,
                path.trim_start_matches('/')
            )
        }
    }
}
