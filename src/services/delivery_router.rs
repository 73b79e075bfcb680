//! Delivery Router: per-request choice between a 302 to the CDN and a direct
//! stream from origin.
//!
//! The choice itself (`decide`) is a pure function of configuration, the
//! persisted object and the request's loop-detection signals, so it can be
//! checked without any I/O. `DeliveryRouter` wraps it with the side effects:
//! access accounting, opportunistic cache flips and the synchronous re-probe.

use crate::{
    config::CdnConfig,
    models::{cache_status::CacheStatus, stored_object::StoredObject},
    services::{
        cdn_probe::{CACHE_STATUS_HEADER, CdnProbe},
        object_store::SharedStore,
        origin_streamer::{AccessType, DirectRequest, OriginStreamer, ServeError},
    },
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Present only on requests the edge makes to origin to fill its cache.
pub const EDGE_ORIGIN_HEADER: &str = "cf-connecting-ip";
pub const REDIRECT_COUNT_HEADER: &str = "x-redirect-count";
pub const CDN_REDIRECT_HEADER: &str = "x-cdn-redirect";

/// Loop-detection inputs pulled off one inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSignals {
    /// The request is an edge pull-through.
    pub edge_origin: bool,
    pub host_is_cdn: bool,
    pub referer_from_cdn: bool,
    pub redirect_count: u32,
    /// Cache status the edge attached to a pull-through, if any.
    pub edge_cache_status: Option<CacheStatus>,
    /// Best reconstruction of the URL the client asked for.
    pub request_url: String,
}

impl RequestSignals {
    pub fn from_request(headers: &HeaderMap, uri: &Uri, cdn_domain: &str) -> Self {
        let host = header_str(headers, "x-forwarded-host")
            .or_else(|| header_str(headers, header::HOST.as_str()))
            .or_else(|| uri.host())
            .unwrap_or_default();
        let scheme = header_str(headers, "x-forwarded-proto")
            .or_else(|| uri.scheme_str())
            .unwrap_or("http");
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let cdn_known = !cdn_domain.is_empty();
        Self {
            edge_origin: headers.contains_key(EDGE_ORIGIN_HEADER),
            host_is_cdn: cdn_known
                && header_str(headers, header::HOST.as_str()) == Some(cdn_domain),
            referer_from_cdn: cdn_known
                && header_str(headers, header::REFERER.as_str())
                    .is_some_and(|r| r.contains(cdn_domain)),
            redirect_count: header_str(headers, REDIRECT_COUNT_HEADER)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            edge_cache_status: header_str(headers, CACHE_STATUS_HEADER)
                .map(CacheStatus::from_header),
            request_url: format!("{}://{}{}", scheme, host, path),
        }
    }
}

/// Why a request is served from origin instead of redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectReason {
    Disabled,
    PullThrough,
    CdnHost,
    CdnReferer,
    GraceWindow,
    RedirectLimit,
    /// The literal request URL already is the CDN URL.
    SelfRedirect,
    NotCached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Redirect { location: String, next_count: u32 },
    Direct(DirectReason),
    /// Persisted state says uncached; ask the edge before serving directly.
    Probe,
}

pub fn decide(
    cfg: &CdnConfig,
    object: &StoredObject,
    signals: &RequestSignals,
    now: DateTime<Utc>,
) -> Decision {
    use DirectReason::*;

    let exemption = if !cfg.redirect_enabled || !cfg.is_active() {
        Some(Disabled)
    } else if signals.edge_origin {
        Some(PullThrough)
    } else if signals.host_is_cdn {
        Some(CdnHost)
    } else if signals.referer_from_cdn {
        Some(CdnReferer)
    } else if object.within_grace(now, cfg.grace_window) {
        Some(GraceWindow)
    } else if signals.redirect_count >= cfg.max_redirect_count {
        Some(RedirectLimit)
    } else {
        None
    };
    if let Some(reason) = exemption {
        return Decision::Direct(reason);
    }

    if !object.cdn_cached {
        return Decision::Probe;
    }

    let location = cfg.image_url(&object.id);
    if signals.request_url.contains(&location) {
        return Decision::Direct(SelfRedirect);
    }
    Decision::Redirect {
        location,
        next_count: signals.redirect_count.saturating_add(1),
    }
}

pub struct DeliveryRouter {
    cfg: CdnConfig,
    probe: CdnProbe,
    store: SharedStore,
    streamer: OriginStreamer,
}

impl DeliveryRouter {
    pub fn new(cfg: CdnConfig, probe: CdnProbe, store: SharedStore, streamer: OriginStreamer) -> Self {
        Self {
            cfg,
            probe,
            store,
            streamer,
        }
    }

    /// Answer one `GET`/`HEAD /image/{id}`.
    pub async fn route(
        &self,
        id: &str,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Result<Response, ServeError> {
        let object = self.store.get_object(id).await?;
        let signals = RequestSignals::from_request(headers, uri, &self.cfg.domain);
        let now = Utc::now();

        let reason = match decide(&self.cfg, &object, &signals, now) {
            Decision::Redirect {
                location,
                next_count,
            } => {
                info!("object {} cached, redirecting to {}", id, location);
                if let Err(err) = self.store.record_access(id).await {
                    warn!("failed to record access for {}: {}", id, err);
                }
                return Ok(self.redirect_response(&location, next_count));
            }
            Decision::Direct(reason) => reason,
            Decision::Probe => {
                // Never redirect the request that discovers the edge copy.
                if self.probe.probe(id).await.cached {
                    self.flip_cached(id).await;
                    info!("object {} found cached at the edge, serving directly", id);
                }
                DirectReason::NotCached
            }
        };

        if reason == DirectReason::SelfRedirect {
            warn!("possible redirect loop for {}, serving directly", id);
        } else {
            debug!("serving {} directly: {:?}", id, reason);
        }

        if signals.edge_origin
            && !object.cdn_cached
            && signals.edge_cache_status.is_some_and(CacheStatus::is_cached)
        {
            self.flip_cached(id).await;
        }

        let request = DirectRequest {
            head_only: *method == Method::HEAD,
            if_none_match: header_str(headers, header::IF_NONE_MATCH.as_str())
                .map(str::to_string),
            range: header_str(headers, header::RANGE.as_str()).map(str::to_string),
            access_type: if signals.edge_origin {
                AccessType::CdnPull
            } else {
                AccessType::DirectAccess
            },
        };
        self.streamer.serve(&object, &request, now).await
    }

    fn redirect_response(&self, location: &str, next_count: u32) -> Response {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::FOUND;
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(location) {
            headers.insert(header::LOCATION, value);
        }
        if let Ok(value) =
            HeaderValue::from_str(&format!("public, max-age={}", self.cfg.redirect_cache_secs))
        {
            headers.insert(header::CACHE_CONTROL, value);
        }
        headers.insert(
            HeaderName::from_static(CDN_REDIRECT_HEADER),
            HeaderValue::from_static("true"),
        );
        headers.insert(
            HeaderName::from_static(REDIRECT_COUNT_HEADER),
            HeaderValue::from(next_count),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        response
    }

    async fn flip_cached(&self, id: &str) {
        if let Err(err) = self.store.update_cache_state(id, true).await {
            warn!("failed to update cdn cache state for {}: {}", id, err);
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::tests::sample_object;
    use std::time::Duration;

    fn cfg() -> CdnConfig {
        CdnConfig {
            domain: "cdn.example.com".into(),
            grace_window: Duration::from_secs(10),
            max_redirect_count: 2,
            ..CdnConfig::default()
        }
    }

    fn at(t0: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        t0 + chrono::Duration::seconds(secs)
    }

    fn plain(count: u32) -> RequestSignals {
        RequestSignals {
            redirect_count: count,
            request_url: "http://origin.example.com/image/abc".into(),
            ..RequestSignals::default()
        }
    }

    fn cached(t0: DateTime<Utc>) -> StoredObject {
        StoredObject {
            cdn_cached: true,
            ..sample_object("abc", t0)
        }
    }

    #[test]
    fn upload_to_redirect_scenario() {
        let cfg = cfg();
        let t0 = Utc::now();

        // t=5: inside grace window
        let fresh = sample_object("abc", t0);
        assert_eq!(
            decide(&cfg, &fresh, &plain(0), at(t0, 5)),
            Decision::Direct(DirectReason::GraceWindow)
        );

        // t=15 after the monitor confirmed the edge copy
        let obj = cached(t0);
        assert_eq!(
            decide(&cfg, &obj, &plain(0), at(t0, 15)),
            Decision::Redirect {
                location: "https://cdn.example.com/image/abc".into(),
                next_count: 1,
            }
        );

        // replayed with the guard tripped
        assert_eq!(
            decide(&cfg, &obj, &plain(2), at(t0, 15)),
            Decision::Direct(DirectReason::RedirectLimit)
        );
    }

    #[test]
    fn grace_window_wins_even_when_cached() {
        let t0 = Utc::now();
        assert_eq!(
            decide(&cfg(), &cached(t0), &plain(0), at(t0, 9)),
            Decision::Direct(DirectReason::GraceWindow)
        );
    }

    #[test]
    fn redirect_limit_is_never_exceeded() {
        let t0 = Utc::now();
        for count in 2..10 {
            assert!(!matches!(
                decide(&cfg(), &cached(t0), &plain(count), at(t0, 3600)),
                Decision::Redirect { .. }
            ));
        }
    }

    #[test]
    fn edge_pull_through_is_always_direct() {
        let t0 = Utc::now();
        let signals = RequestSignals {
            edge_origin: true,
            ..plain(0)
        };
        assert_eq!(
            decide(&cfg(), &cached(t0), &signals, at(t0, 3600)),
            Decision::Direct(DirectReason::PullThrough)
        );
    }

    #[test]
    fn cdn_host_and_referer_are_direct() {
        let t0 = Utc::now();
        let obj = cached(t0);
        let host = RequestSignals {
            host_is_cdn: true,
            ..plain(0)
        };
        let referer = RequestSignals {
            referer_from_cdn: true,
            ..plain(0)
        };
        assert_eq!(
            decide(&cfg(), &obj, &host, at(t0, 60)),
            Decision::Direct(DirectReason::CdnHost)
        );
        assert_eq!(
            decide(&cfg(), &obj, &referer, at(t0, 60)),
            Decision::Direct(DirectReason::CdnReferer)
        );
    }

    #[test]
    fn disabled_redirects_serve_directly() {
        let t0 = Utc::now();
        let off = CdnConfig {
            redirect_enabled: false,
            ..cfg()
        };
        assert_eq!(
            decide(&off, &cached(t0), &plain(0), at(t0, 60)),
            Decision::Direct(DirectReason::Disabled)
        );
        assert_eq!(
            decide(&CdnConfig::default(), &cached(t0), &plain(0), at(t0, 60)),
            Decision::Direct(DirectReason::Disabled)
        );
    }

    #[test]
    fn uncached_objects_are_probed_first() {
        let t0 = Utc::now();
        assert_eq!(
            decide(&cfg(), &sample_object("abc", t0), &plain(0), at(t0, 60)),
            Decision::Probe
        );
    }

    #[test]
    fn self_redirect_guard() {
        let t0 = Utc::now();
        let signals = RequestSignals {
            request_url: "https://cdn.example.com/image/abc?x=1".into(),
            ..plain(0)
        };
        assert_eq!(
            decide(&cfg(), &cached(t0), &signals, at(t0, 60)),
            Decision::Direct(DirectReason::SelfRedirect)
        );
    }

    #[test]
    fn signals_are_read_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("cdn.example.com"));
        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://cdn.example.com/gallery"),
        );
        headers.insert(REDIRECT_COUNT_HEADER, HeaderValue::from_static("1"));
        headers.insert(EDGE_ORIGIN_HEADER, HeaderValue::from_static("203.0.113.7"));
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
        let uri: Uri = "/image/abc".parse().unwrap();

        let signals = RequestSignals::from_request(&headers, &uri, "cdn.example.com");
        assert!(signals.edge_origin);
        assert!(signals.host_is_cdn);
        assert!(signals.referer_from_cdn);
        assert_eq!(signals.redirect_count, 1);
        assert_eq!(signals.edge_cache_status, Some(CacheStatus::Hit));
        assert_eq!(signals.request_url, "http://cdn.example.com/image/abc");
    }

    #[test]
    fn garbage_redirect_count_defaults_to_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(REDIRECT_COUNT_HEADER, HeaderValue::from_static("lots"));
        let uri: Uri = "/image/abc".parse().unwrap();
        let signals = RequestSignals::from_request(&headers, &uri, "cdn.example.com");
        assert_eq!(signals.redirect_count, 0);
        assert!(!signals.host_is_cdn);
    }
}
