//! Cache-first request routing with asynchronous write-back
//!
//! Every intercepted request checks the current generation's store before
//! the network. Cacheable network responses are persisted without delaying
//! the caller; write-back failures are logged, never surfaced.

use crate::cache::fetcher::{Fetch, FetchFailure, FetchedResponse};
use crate::cache::{CacheError, CacheStore, GenerationId, RequestKey, StoreBackend, StoredResponse};
use crate::config::ProxyConfig;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where a routed response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Served from the current generation's store, network untouched
    Cache,
    /// Fetched live from the network
    Network,
    /// The configured offline fallback page
    Fallback,
}

/// Response handed back to the client for one routed request
#[derive(Debug)]
pub struct RoutedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub source: RouteSource,
    /// Handle for the in-flight write-back, if one was spawned. Production
    /// callers drop it (fire and forget); tests await it to observe
    /// settlement.
    pub writeback: Option<JoinHandle<()>>,
}

impl RoutedResponse {
    fn from_stored(stored: StoredResponse, source: RouteSource) -> Self {
        RoutedResponse {
            status: stored.status,
            headers: stored.headers,
            body: stored.body,
            source,
            writeback: None,
        }
    }
}

/// Routes every request from claimed clients between cache and network
pub struct RequestRouter {
    backend: Arc<dyn StoreBackend>,
    fetcher: Arc<dyn Fetch>,
    config: Arc<ProxyConfig>,
    /// Generation published by the controller at claim time; `None` until
    /// activation completes
    active: watch::Receiver<Option<GenerationId>>,
}

impl RequestRouter {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        fetcher: Arc<dyn Fetch>,
        config: Arc<ProxyConfig>,
        active: watch::Receiver<Option<GenerationId>>,
    ) -> Self {
        RequestRouter {
            backend,
            fetcher,
            config,
            active,
        }
    }

    /// Route one intercepted request
    ///
    /// Cache lookup always precedes the network attempt. On a miss, the
    /// network response is returned as-is; if it is a basic same-origin 200
    /// and the endpoint is not excluded, an independent copy is written
    /// back to the current store without blocking the caller.
    pub async fn route(
        &self,
        key: RequestKey,
        body: Option<Vec<u8>>,
    ) -> Result<RoutedResponse, CacheError> {
        let generation = self.active.borrow().clone();
        let Some(generation) = generation else {
            // Client not yet claimed: pure pass-through
            debug!("No active generation, bypassing cache for {}", key);
            let response = self
                .fetcher
                .fetch(&key, body)
                .await
                .map_err(FetchFailure::into_error)?;
            return Ok(split_network_response(response, None));
        };

        let store = self.backend.open(&generation).await?;
        if let Some(stored) = store.get(&key).await? {
            debug!("Cache hit for {} in generation {}", key, generation);
            return Ok(RoutedResponse::from_stored(stored, RouteSource::Cache));
        }

        let excluded = self.config.is_excluded(&key.url);
        match self.fetcher.fetch(&key, body).await {
            Ok(response) => {
                let writeback = if !excluded
                    && response.is_cacheable_for(&self.config.upstream_origin)
                {
                    Some(self.spawn_writeback(store, key, &response))
                } else {
                    None
                };
                Ok(split_network_response(response, writeback))
            }
            Err(failure) if excluded => {
                // Excluded endpoints report their real failure, no fallback
                Err(failure.into_error())
            }
            Err(failure) => self.fallback_or_fail(store.as_ref(), failure).await,
        }
    }

    /// Persist an independent copy of a network response, off the response
    /// path
    fn spawn_writeback(
        &self,
        store: Arc<dyn CacheStore>,
        key: RequestKey,
        response: &FetchedResponse,
    ) -> JoinHandle<()> {
        let stored = response.clone().into_stored();
        tokio::spawn(async move {
            if let Err(e) = store.put(&key, &stored).await {
                warn!("Write-back for {} failed: {}", key, e);
            } else {
                debug!("Write-back for {} settled", key);
            }
        })
    }

    /// Network failure with no cached entry: serve the configured fallback
    /// page from the current store, or surface the failure
    async fn fallback_or_fail(
        &self,
        store: &dyn CacheStore,
        failure: FetchFailure,
    ) -> Result<RoutedResponse, CacheError> {
        if let Some(page) = &self.config.fallback_page {
            let url = self.config.resolve_locator(page)?;
            if let Some(stored) = store.get(&RequestKey::get(url)).await? {
                warn!(
                    "Network unavailable for {}, serving fallback page {}",
                    failure.url, page
                );
                return Ok(RoutedResponse::from_stored(stored, RouteSource::Fallback));
            }
        }
        Err(failure.into_error())
    }
}

/// Split a buffered network response into the caller's copy and (optionally)
/// the write-back copy
///
/// The body was consumed off the wire exactly once when the fetcher buffered
/// it; from here on both consumers hold independent byte buffers.
fn split_network_response(
    response: FetchedResponse,
    writeback: Option<JoinHandle<()>>,
) -> RoutedResponse {
    RoutedResponse {
        status: response.status,
        headers: response.headers,
        body: response.body,
        source: RouteSource::Network,
        writeback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryStoreBackend;
    use crate::config::Manifest;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const ORIGIN: &str = "http://app.example.com";

    struct MockFetcher {
        responses: HashMap<String, FetchedResponse>,
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn new() -> Self {
            MockFetcher {
                responses: HashMap::new(),
                offline: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }

        fn serve(mut self, url: &str, status: u16, body: &[u8]) -> Self {
            self.responses.insert(
                url.to_string(),
                FetchedResponse {
                    status,
                    headers: vec![("content-type".to_string(), "text/plain".to_string())],
                    body: body.to_vec(),
                    final_url: url.to_string(),
                },
            );
            self
        }

        fn go_offline(&self) {
            self.offline.store(true, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Fetch for MockFetcher {
        async fn fetch(
            &self,
            key: &RequestKey,
            _body: Option<Vec<u8>>,
        ) -> Result<FetchedResponse, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(FetchFailure {
                    url: key.url.clone(),
                    reason: "network is down".to_string(),
                });
            }
            self.responses.get(&key.url).cloned().ok_or_else(|| FetchFailure {
                url: key.url.clone(),
                reason: "no route to host".to_string(),
            })
        }
    }

    struct Fixture {
        backend: Arc<MemoryStoreBackend>,
        fetcher: Arc<MockFetcher>,
        router: RequestRouter,
        _active_tx: watch::Sender<Option<GenerationId>>,
    }

    fn fixture(fetcher: MockFetcher, active: Option<&str>) -> Fixture {
        fixture_with(fetcher, active, None)
    }

    fn fixture_with(
        fetcher: MockFetcher,
        active: Option<&str>,
        fallback_page: Option<&str>,
    ) -> Fixture {
        let backend = Arc::new(MemoryStoreBackend::new());
        let fetcher = Arc::new(fetcher);
        let mut config = ProxyConfig::new(
            GenerationId::new(active.unwrap_or("v1")),
            Manifest::new(["/index.html"]),
            ORIGIN,
        )
        .unwrap();
        config.fallback_page = fallback_page.map(str::to_string);
        let (tx, rx) = watch::channel(active.map(GenerationId::new));
        let router = RequestRouter::new(backend.clone(), fetcher.clone(), Arc::new(config), rx);
        Fixture {
            backend,
            fetcher,
            router,
            _active_tx: tx,
        }
    }

    #[tokio::test]
    async fn test_cache_hit_never_touches_network() {
        let fx = fixture(MockFetcher::new(), Some("v1"));
        let key = RequestKey::get(format!("{}/index.html", ORIGIN));
        let store = fx.backend.open(&GenerationId::new("v1")).await.unwrap();
        store
            .put(
                &key,
                &StoredResponse {
                    status: 200,
                    headers: vec![],
                    body: b"cached".to_vec(),
                },
            )
            .await
            .unwrap();

        // Network is implicitly down (mock serves nothing)
        let routed = fx.router.route(key, None).await.unwrap();
        assert_eq!(routed.source, RouteSource::Cache);
        assert_eq!(routed.body, b"cached");
        assert_eq!(fx.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_writes_back_and_returns_bytes() {
        let url = format!("{}/photo.png", ORIGIN);
        let fx = fixture(MockFetcher::new().serve(&url, 200, b"png-bytes"), Some("v1"));
        let key = RequestKey::get(&url);

        let routed = fx.router.route(key.clone(), None).await.unwrap();
        assert_eq!(routed.source, RouteSource::Network);
        assert_eq!(routed.body, b"png-bytes");

        // After the write-back settles, the store holds identical bytes
        routed.writeback.unwrap().await.unwrap();
        let store = fx.backend.open(&GenerationId::new("v1")).await.unwrap();
        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.body, b"png-bytes");
    }

    #[tokio::test]
    async fn test_excluded_endpoint_never_written() {
        let url = "https://signaling.example.com/peer";
        let fx = fixture(MockFetcher::new().serve(url, 200, b"offer"), Some("v1"));

        let routed = fx.router.route(RequestKey::get(url), None).await.unwrap();
        assert_eq!(routed.source, RouteSource::Network);
        assert_eq!(routed.body, b"offer");
        assert!(routed.writeback.is_none());

        let store = fx.backend.open(&GenerationId::new("v1")).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_200_not_written() {
        let url = format!("{}/missing", ORIGIN);
        let fx = fixture(MockFetcher::new().serve(&url, 404, b"not found"), Some("v1"));

        let routed = fx.router.route(RequestKey::get(&url), None).await.unwrap();
        assert_eq!(routed.status, 404);
        assert!(routed.writeback.is_none());
    }

    #[tokio::test]
    async fn test_cross_origin_response_not_written() {
        let url = "https://cdn.example.net/lib.js";
        let fx = fixture(MockFetcher::new().serve(url, 200, b"lib"), Some("v1"));

        let routed = fx.router.route(RequestKey::get(url), None).await.unwrap();
        assert_eq!(routed.body, b"lib");
        assert!(routed.writeback.is_none());
    }

    #[tokio::test]
    async fn test_previously_written_entry_served_offline() {
        let url = format!("{}/app.js", ORIGIN);
        let fx = fixture(MockFetcher::new().serve(&url, 200, b"console.log(1)"), Some("v1"));
        let key = RequestKey::get(&url);

        let first = fx.router.route(key.clone(), None).await.unwrap();
        first.writeback.unwrap().await.unwrap();

        fx.fetcher.go_offline();
        let second = fx.router.route(key, None).await.unwrap();
        assert_eq!(second.source, RouteSource::Cache);
        assert_eq!(second.body, b"console.log(1)");
    }

    #[tokio::test]
    async fn test_network_failure_without_cache_surfaces_error() {
        let fx = fixture(MockFetcher::new(), Some("v1"));
        let err = fx
            .router
            .route(RequestKey::get(format!("{}/anything", ORIGIN)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NetworkUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_network_failure_serves_configured_fallback() {
        let fx = fixture_with(MockFetcher::new(), Some("v1"), Some("/offline.html"));
        let store = fx.backend.open(&GenerationId::new("v1")).await.unwrap();
        store
            .put(
                &RequestKey::get(format!("{}/offline.html", ORIGIN)),
                &StoredResponse {
                    status: 200,
                    headers: vec![("content-type".to_string(), "text/html".to_string())],
                    body: b"<h1>offline</h1>".to_vec(),
                },
            )
            .await
            .unwrap();

        let routed = fx
            .router
            .route(RequestKey::get(format!("{}/anything", ORIGIN)), None)
            .await
            .unwrap();
        assert_eq!(routed.source, RouteSource::Fallback);
        assert_eq!(routed.body, b"<h1>offline</h1>");
    }

    #[tokio::test]
    async fn test_excluded_failure_skips_fallback() {
        let fx = fixture_with(MockFetcher::new(), Some("v1"), Some("/offline.html"));
        let err = fx
            .router
            .route(RequestKey::get("https://signaling.example.com/peer"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NetworkUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unclaimed_client_bypasses_cache() {
        let url = format!("{}/index.html", ORIGIN);
        let fx = fixture(MockFetcher::new().serve(&url, 200, b"live"), None);

        let routed = fx.router.route(RequestKey::get(&url), None).await.unwrap();
        assert_eq!(routed.source, RouteSource::Network);
        assert!(routed.writeback.is_none());
        assert!(fx.backend.list_generations().await.unwrap().is_empty());
    }
}
