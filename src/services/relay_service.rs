//! RelayService: wires the CDN subsystem together and is the shared axum state.
//!
//! It also carries the ingestion hook: once the blob provider has accepted an
//! upload, `register_object` assigns the opaque id, persists the row and hands
//! the object to the cache monitor.

use crate::{
    config::{AppConfig, CdnConfig},
    models::stored_object::{NewObject, StorageRef, StoredObject},
    services::{
        cache_monitor::{CacheMonitor, MonitorError},
        cdn_probe::CdnProbe,
        delivery_router::DeliveryRouter,
        object_store::{
            SharedResolver, SharedStore, SqliteObjectStore, StoreResult, TelegramPathResolver,
        },
        origin_streamer::OriginStreamer,
    },
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct RelayService {
    /// Shared SQLite connection pool, also used by the readiness probe.
    pub db: Arc<SqlitePool>,
    pub cdn: CdnConfig,
    pub store: SharedStore,
    pub probe: CdnProbe,
    pub router: Arc<DeliveryRouter>,
    pub monitor: Arc<CacheMonitor>,
}

impl RelayService {
    /// Build the production wiring from application config.
    pub fn new(db: Arc<SqlitePool>, cfg: &AppConfig) -> Result<Self, reqwest::Error> {
        let resolver: SharedResolver = Arc::new(TelegramPathResolver::new(
            cfg.upstream.api_base.clone(),
            cfg.upstream.bot_token.clone(),
            cfg.upstream.refresh_timeout,
        )?);
        let probe = CdnProbe::new(&cfg.cdn)?;
        Self::assemble(db, cfg.cdn.clone(), resolver, probe, cfg.upstream.fetch_timeout)
    }

    /// Build from explicit collaborators.
    pub fn assemble(
        db: Arc<SqlitePool>,
        cdn: CdnConfig,
        resolver: SharedResolver,
        probe: CdnProbe,
        fetch_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let store: SharedStore = Arc::new(SqliteObjectStore::new(db.clone()));
        let streamer = OriginStreamer::new(cdn.clone(), store.clone(), resolver, fetch_timeout)?;
        let router = DeliveryRouter::new(cdn.clone(), probe.clone(), store.clone(), streamer);
        let monitor = CacheMonitor::new(cdn.clone(), probe.clone(), store.clone());

        Ok(Self {
            db,
            cdn,
            store,
            probe,
            router: Arc::new(router),
            monitor: Arc::new(monitor),
        })
    }

    /// Persist a completed upload and start reconciling its edge state.
    pub async fn register_object(&self, new: NewObject) -> StoreResult<StoredObject> {
        let id = generate_object_id();
        let object = StoredObject {
            etag: StoredObject::etag_for(&id, new.file_size),
            id,
            storage: StorageRef {
                file_id: new.file_id,
                file_path: new.file_path,
            },
            file_size: new.file_size,
            mime_type: new.mime_type,
            original_filename: new.original_filename,
            uploaded_at: Utc::now(),
            cdn_cached: false,
            cdn_cache_time: None,
            access_count: 0,
            last_accessed_at: None,
        };
        self.store.insert_object(&object).await?;
        info!("registered object {}", object.id);

        match self.monitor.enqueue(&object.id, object.uploaded_at) {
            Ok(()) | Err(MonitorError::QueueFull(_)) => {}
            Err(err) => debug!("not monitoring {}: {}", object.id, err),
        }

        if self.cdn.warming_enabled && self.cdn.is_active() {
            let probe = self.probe.clone();
            let store = self.store.clone();
            let delay = self.cdn.warming_delay;
            let id = object.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                probe.warm(&probe.image_url(&id), &id, store.as_ref()).await;
            });
        }

        Ok(object)
    }
}

/// Random, URL-safe, never decoded.
pub fn generate_object_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ids_are_opaque_and_unique() {
        let a = generate_object_id();
        let b = generate_object_id();
        assert_eq!(a.len(), 22);
        assert_ne!(a, b);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }
}
