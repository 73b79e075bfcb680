//! CDN Probe: asks the edge whether it already holds an object, and can
//! push an object into several edge locations at once.
//!
//! Probes never follow redirects: the origin only answers with a 302 when it
//! believes the object is uncached, so a 302 coming back through the edge is
//! itself proof of a miss.

use crate::{
    config::CdnConfig,
    models::cache_status::{CacheProbeResult, CacheStatus},
    services::object_store::ObjectStore,
};
use futures::future::join_all;
use reqwest::{StatusCode, redirect::Policy};
use tracing::{debug, info, warn};

/// Response header the edge uses to report cache state.
pub const CACHE_STATUS_HEADER: &str = "cf-cache-status";

/// Synthetic edge-location hints used to spread warming requests.
const EDGE_LOCATIONS: [&str; 9] = ["sfo", "lax", "ord", "dfw", "iad", "lhr", "fra", "nrt", "sin"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmOutcome {
    pub succeeded: usize,
    pub attempted: usize,
}

impl WarmOutcome {
    pub fn any_success(&self) -> bool {
        self.succeeded > 0
    }
}

#[derive(Clone)]
pub struct CdnProbe {
    probe_client: reqwest::Client,
    warm_client: reqwest::Client,
    base_url: String,
    active: bool,
    warm_timeout: std::time::Duration,
}

impl CdnProbe {
    pub fn new(cfg: &CdnConfig) -> Result<Self, reqwest::Error> {
        let probe_client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(cfg.probe_timeout)
            .user_agent("CDN-Status-Checker/1.0")
            .build()?;
        let warm_client = reqwest::Client::builder()
            .user_agent("Cloudflare-Cache-Warmer/1.0")
            .build()?;

        Ok(Self {
            probe_client,
            warm_client,
            base_url: cfg.cdn_base_url(),
            active: cfg.is_active(),
            warm_timeout: cfg.warm_timeout,
        })
    }

    /// Point the probe at a different edge root (plain-HTTP test doubles, mostly).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn image_url(&self, id: &str) -> String {
        format!("{}/image/{}", self.base_url, id)
    }

    /// HEAD the object's CDN URL and classify the answer.
    ///
    /// Transport errors and timeouts are a miss, never an error.
    pub async fn probe(&self, id: &str) -> CacheProbeResult {
        if !self.active {
            return CacheProbeResult::miss();
        }

        let response = match self
            .probe_client
            .head(self.image_url(id))
            .header("X-CDN-Check", "true")
            .header("X-Skip-Redirect", "true")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                warn!("cdn probe for {} timed out", id);
                return CacheProbeResult::miss();
            }
            Err(err) => {
                debug!("cdn probe for {} failed: {}", id, err);
                return CacheProbeResult::miss();
            }
        };

        if response.status() == StatusCode::FOUND {
            debug!("cdn answered 302 for {}, not cached", id);
            return CacheProbeResult::miss();
        }

        let status = response
            .headers()
            .get(CACHE_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(CacheStatus::from_header)
            .unwrap_or(CacheStatus::Miss);

        let result = CacheProbeResult {
            cached: status.is_cached(),
            status,
        };
        if result.cached {
            info!("cdn cache status for {}: {}", id, status);
        } else {
            debug!("cdn cache status for {}: {}", id, status);
        }
        result
    }

    /// Fan out one GET per edge location; success is any 200/304.
    ///
    /// On success the object is marked cached in `store`.
    pub async fn warm(&self, url: &str, id: &str, store: &dyn ObjectStore) -> WarmOutcome {
        let requests = EDGE_LOCATIONS.iter().map(|location| {
            self.warm_client
                .get(url)
                .timeout(self.warm_timeout)
                .header("CF-IPCountry", location.to_ascii_uppercase())
                .header("X-Cache-Warming", "true")
                .send()
        });

        let succeeded = join_all(requests)
            .await
            .into_iter()
            .filter(|result| match result {
                Ok(resp) => matches!(resp.status(), StatusCode::OK | StatusCode::NOT_MODIFIED),
                Err(err) => {
                    debug!("warm request for {} failed: {}", id, err);
                    false
                }
            })
            .count();

        let outcome = WarmOutcome {
            succeeded,
            attempted: EDGE_LOCATIONS.len(),
        };
        info!(
            "cache warming for {} finished: {}/{} succeeded",
            url, outcome.succeeded, outcome.attempted
        );

        if outcome.any_success() {
            if let Err(err) = store.update_cache_state(id, true).await {
                warn!("could not record warmed cache state for {}: {}", id, err);
            }
        }
        outcome
    }
}
