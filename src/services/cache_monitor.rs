//! Cache Monitor Queue: background reconciliation of edge cache state.
//!
//! A bounded queue feeds a single consumer that probes one object at a time.
//! A miss is retried by re-queueing the task after `monitor_interval` from
//! its own timer task, so one object's backoff never holds up the others.
//! Once the retry budget is spent the object gets one warming fan-out and a
//! final probe; if that still misses it is dropped without further action.
//!
//! Enqueueing never blocks: a full queue drops the task and logs it.

use crate::{
    config::CdnConfig,
    models::monitor_task::MonitorTask,
    services::{
        cdn_probe::CdnProbe,
        object_store::{SharedStore, StoreError},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("monitor queue is full, dropping `{0}`")]
    QueueFull(String),
    #[error("cache monitoring is disabled")]
    Disabled,
    #[error("cache monitor has been stopped")]
    Stopped,
}

/// Counters exposed on the readiness endpoint. Purely observational.
#[derive(Debug, Default)]
pub struct MonitorStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    probes: AtomicU64,
    skipped: AtomicU64,
    cached: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MonitorStatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub probes: u64,
    pub skipped: u64,
    pub cached: u64,
    pub exhausted: u64,
}

impl MonitorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Owned monitor with an explicit `start`/`stop` lifecycle.
pub struct CacheMonitor {
    cfg: CdnConfig,
    probe: CdnProbe,
    store: SharedStore,
    sender: mpsc::Sender<MonitorTask>,
    receiver: Mutex<Option<mpsc::Receiver<MonitorTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    stats: Arc<MonitorStats>,
}

impl CacheMonitor {
    pub fn new(cfg: CdnConfig, probe: CdnProbe, store: SharedStore) -> Self {
        let (sender, receiver) = mpsc::channel(cfg.monitor_queue_size.max(1));
        Self {
            cfg,
            probe,
            store,
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            cancel: CancellationToken::new(),
            stats: Arc::new(MonitorStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.monitor_enabled && self.cfg.is_active()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> MonitorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the consumer. Calling it twice, or on a disabled monitor, is a no-op.
    pub fn start(&self) {
        if !self.is_enabled() {
            info!("cdn cache monitor disabled");
            return;
        }

        let receiver = match self.receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(receiver) = receiver else {
            warn!("cdn cache monitor already started");
            return;
        };

        let worker = Worker {
            cfg: self.cfg.clone(),
            probe: self.probe.clone(),
            store: self.store.clone(),
            sender: self.sender.clone(),
            cancel: self.cancel.clone(),
            stats: self.stats.clone(),
        };
        let handle = tokio::spawn(worker.run(receiver));

        if let Ok(mut guard) = self.worker.lock() {
            *guard = Some(handle);
        }
        info!(
            "cdn cache monitor started (queue={}, retries={}, interval={:?})",
            self.cfg.monitor_queue_size, self.cfg.monitor_max_retries, self.cfg.monitor_interval
        );
    }

    /// Cancel the consumer and any pending backoff timers, then wait for the
    /// consumer to exit for at most `shutdown_grace`.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };

        info!("stopping cdn cache monitor...");
        match tokio::time::timeout(self.cfg.shutdown_grace, handle).await {
            Ok(Ok(())) => info!("cdn cache monitor stopped"),
            Ok(Err(err)) => warn!("cdn cache monitor ended abnormally: {}", err),
            Err(_) => warn!(
                "cdn cache monitor did not stop within {:?}",
                self.cfg.shutdown_grace
            ),
        }
    }

    /// Fire-and-forget registration of an object for monitoring.
    pub fn enqueue(&self, id: &str, uploaded_at: DateTime<Utc>) -> Result<(), MonitorError> {
        if !self.is_enabled() {
            return Err(MonitorError::Disabled);
        }
        if self.cancel.is_cancelled() {
            return Err(MonitorError::Stopped);
        }

        match self.sender.try_send(MonitorTask::new(id, uploaded_at)) {
            Ok(()) => {
                MonitorStats::bump(&self.stats.enqueued);
                info!("object {} queued for cdn monitoring", id);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                MonitorStats::bump(&self.stats.dropped);
                warn!("cdn monitor queue full, cannot add {}", id);
                Err(MonitorError::QueueFull(id.to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(MonitorError::Stopped),
        }
    }

    /// Re-queue recent uncached objects so monitoring survives a restart.
    pub async fn restore_pending(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }

        let window = chrono::Duration::from_std(self.cfg.restore_window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let pending = match self
            .store
            .list_pending_monitoring(Utc::now() - window, self.cfg.restore_limit)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!("failed to restore cdn monitor tasks: {}", err);
                return 0;
            }
        };

        let restored = pending
            .iter()
            .filter(|(id, uploaded_at)| self.enqueue(id, *uploaded_at).is_ok())
            .count();
        if restored > 0 {
            info!("restored {} cdn monitor tasks", restored);
        }
        restored
    }
}

/// State the consumer and its timer tasks share.
#[derive(Clone)]
struct Worker {
    cfg: CdnConfig,
    probe: CdnProbe,
    store: SharedStore,
    sender: mpsc::Sender<MonitorTask>,
    cancel: CancellationToken,
    stats: Arc<MonitorStats>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<MonitorTask>) {
        info!("cdn cache monitor worker running");
        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = receiver.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            self.process(task).await;
        }
        info!("cdn cache monitor worker exited");
    }

    async fn process(&self, task: MonitorTask) {
        let id = task.object_id.as_str();

        match self.store.get_object(id).await {
            Ok(object) if object.cdn_cached => {
                MonitorStats::bump(&self.stats.skipped);
                debug!("object {} already marked cached, skipping", id);
                return;
            }
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                MonitorStats::bump(&self.stats.skipped);
                debug!("object {} no longer exists, dropping monitor task", id);
                return;
            }
            Err(err) => warn!("could not read state of {}, probing anyway: {}", id, err),
        }

        MonitorStats::bump(&self.stats.probes);
        if self.probe.probe(id).await.cached {
            self.mark_cached(id).await;
            info!(
                "object {} cached at the edge (check #{}, {}s after upload)",
                id,
                task.retry_count + 1,
                (Utc::now() - task.uploaded_at).num_seconds()
            );
            return;
        }

        if task.retry_count < self.cfg.monitor_max_retries {
            debug!(
                "object {} not cached on check #{} (queued {}ms ago), retrying",
                id,
                task.retry_count + 1,
                (Utc::now() - task.enqueued_at).num_milliseconds()
            );
            tokio::spawn(self.clone().requeue_later(task.next_attempt()));
        } else {
            tokio::spawn(self.clone().exhaust(task));
        }
    }

    async fn requeue_later(self, task: MonitorTask) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.cfg.monitor_interval) => {}
        }
        if let Err(err) = self.sender.try_send(task) {
            let id = match &err {
                TrySendError::Full(task) | TrySendError::Closed(task) => task.object_id.clone(),
            };
            MonitorStats::bump(&self.stats.dropped);
            warn!("cdn monitor queue full, giving up on {}", id);
        }
    }

    /// Retry budget spent: one warming pass, one last probe, then let go.
    async fn exhaust(self, task: MonitorTask) {
        let id = task.object_id.as_str();
        warn!(
            "object {} not cached after {} checks, trying active warm-up",
            id,
            task.retry_count + 1
        );

        let mut warmed = false;
        if self.cfg.warming_enabled {
            let outcome = self
                .probe
                .warm(&self.probe.image_url(id), id, self.store.as_ref())
                .await;
            warmed = outcome.any_success();
        }

        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.cfg.warm_recheck_delay) => {}
        }

        MonitorStats::bump(&self.stats.probes);
        if self.probe.probe(id).await.cached {
            self.mark_cached(id).await;
            info!("object {} cached after warm-up", id);
        } else if warmed {
            MonitorStats::bump(&self.stats.cached);
            info!("object {} warmed, edge not yet reporting a hit", id);
        } else {
            MonitorStats::bump(&self.stats.exhausted);
            warn!("giving up cdn monitoring for {}", id);
        }
    }

    async fn mark_cached(&self, id: &str) {
        if let Err(err) = self.store.update_cache_state(id, true).await {
            warn!("failed to record cdn cache state for {}: {}", id, err);
        }
        MonitorStats::bump(&self.stats.cached);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::tests::{memory_store, sample_object};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_cfg() -> CdnConfig {
        CdnConfig {
            domain: "cdn.test".into(),
            monitor_interval: Duration::from_millis(10),
            monitor_max_retries: 2,
            warm_recheck_delay: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(500),
            warm_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(1),
            ..CdnConfig::default()
        }
    }

    async fn monitor_for(server: &MockServer, cfg: CdnConfig) -> (CacheMonitor, SharedStore) {
        let store: SharedStore = Arc::new(memory_store().await);
        let probe = CdnProbe::new(&cfg).unwrap().with_base_url(server.uri());
        (CacheMonitor::new(cfg, probe, store.clone()), store)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn count_requests(server: &MockServer, verb: &str) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|req| req.method.as_str() == verb)
            .count()
    }

    async fn count_path(server: &MockServer, wanted: &str) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|req| req.method.as_str() == "HEAD" && req.url.path() == wanted)
            .count()
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let server = MockServer::start().await;
        let cfg = CdnConfig {
            monitor_queue_size: 1,
            ..fast_cfg()
        };
        let (monitor, _store) = monitor_for(&server, cfg).await;

        assert_eq!(monitor.enqueue("a", Utc::now()), Ok(()));
        assert_eq!(
            monitor.enqueue("b", Utc::now()),
            Err(MonitorError::QueueFull("b".into()))
        );
        assert_eq!(monitor.stats().dropped, 1);
    }

    #[tokio::test]
    async fn retry_into_full_queue_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/image/a"))
            .respond_with(ResponseTemplate::new(200).insert_header("CF-Cache-Status", "MISS"))
            .mount(&server)
            .await;
        // keeps the worker busy while "a" waits out its backoff
        Mock::given(method("HEAD"))
            .and(path("/image/b"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("CF-Cache-Status", "MISS")
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;
        let cfg = CdnConfig {
            monitor_queue_size: 1,
            monitor_interval: Duration::from_millis(300),
            probe_timeout: Duration::from_secs(5),
            ..fast_cfg()
        };
        let (monitor, store) = monitor_for(&server, cfg).await;
        for id in ["a", "b"] {
            store.insert_object(&sample_object(id, Utc::now())).await.unwrap();
        }

        monitor.start();
        monitor.enqueue("a", Utc::now()).unwrap();
        wait_until(|| monitor.stats().probes == 1).await;
        monitor.enqueue("b", Utc::now()).unwrap();
        wait_until(|| monitor.stats().probes == 2).await;
        // occupies the only slot when a's timer fires
        monitor.enqueue("c", Utc::now()).unwrap();

        wait_until(|| monitor.stats().dropped == 1).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count_path(&server, "/image/a").await, 1);
        assert!(!store.get_object("a").await.unwrap().cdn_cached);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn disabled_monitor_refuses_work() {
        let server = MockServer::start().await;
        let cfg = CdnConfig {
            monitor_enabled: false,
            ..fast_cfg()
        };
        let (monitor, _store) = monitor_for(&server, cfg).await;
        monitor.start();
        assert!(!monitor.is_running());
        assert_eq!(monitor.enqueue("a", Utc::now()), Err(MonitorError::Disabled));
    }

    #[tokio::test]
    async fn hit_flips_cache_state() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("CF-Cache-Status", "HIT"))
            .mount(&server)
            .await;
        let (monitor, store) = monitor_for(&server, fast_cfg()).await;
        store
            .insert_object(&sample_object("abc", Utc::now()))
            .await
            .unwrap();

        monitor.start();
        assert!(monitor.is_running());
        monitor.enqueue("abc", Utc::now()).unwrap();
        wait_until(|| monitor.stats().cached == 1).await;

        assert!(store.get_object("abc").await.unwrap().cdn_cached);
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn already_cached_objects_are_not_probed() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let (monitor, store) = monitor_for(&server, fast_cfg()).await;
        store
            .insert_object(&sample_object("abc", Utc::now()))
            .await
            .unwrap();
        store.update_cache_state("abc", true).await.unwrap();

        monitor.start();
        monitor.enqueue("abc", Utc::now()).unwrap();
        wait_until(|| monitor.stats().skipped == 1).await;
        monitor.stop().await;
    }

    #[tokio::test]
    async fn retries_are_bounded_then_warm_and_give_up() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("CF-Cache-Status", "MISS"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (monitor, store) = monitor_for(&server, fast_cfg()).await;
        store
            .insert_object(&sample_object("abc", Utc::now()))
            .await
            .unwrap();

        monitor.start();
        monitor.enqueue("abc", Utc::now()).unwrap();
        wait_until(|| monitor.stats().exhausted == 1).await;

        // first check + 2 retries + the final post-warm probe
        assert_eq!(count_requests(&server, "HEAD").await, 4);
        assert_eq!(count_requests(&server, "GET").await, 9);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count_requests(&server, "HEAD").await, 4);
        assert!(!store.get_object("abc").await.unwrap().cdn_cached);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let cfg = CdnConfig {
            monitor_interval: Duration::from_secs(60),
            ..fast_cfg()
        };
        let (monitor, store) = monitor_for(&server, cfg).await;
        store
            .insert_object(&sample_object("abc", Utc::now()))
            .await
            .unwrap();

        monitor.start();
        monitor.enqueue("abc", Utc::now()).unwrap();
        wait_until(|| monitor.stats().probes == 1).await;

        tokio::time::timeout(Duration::from_millis(500), monitor.stop())
            .await
            .expect("stop returns promptly");
        assert_eq!(monitor.enqueue("abc", Utc::now()), Err(MonitorError::Stopped));
    }

    #[tokio::test]
    async fn restore_requeues_recent_uncached_objects() {
        let server = MockServer::start().await;
        let (monitor, store) = monitor_for(&server, fast_cfg()).await;
        let now = Utc::now();
        store.insert_object(&sample_object("fresh", now)).await.unwrap();
        store
            .insert_object(&sample_object("stale", now - chrono::Duration::days(3)))
            .await
            .unwrap();

        assert_eq!(monitor.restore_pending().await, 1);
        assert_eq!(monitor.stats().enqueued, 1);
    }
}
