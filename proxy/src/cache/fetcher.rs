//! Network fetcher behind the cache proxy

use crate::cache::{CacheError, RequestKey, StoredResponse};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// A response fetched from the network, buffered in full
///
/// The body is read exactly once off the wire; callers that need two
/// consumers (the client response and the write-back path) clone the
/// buffered bytes, never the underlying stream.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// URL the response actually came from, after redirects
    pub final_url: String,
}

impl FetchedResponse {
    /// Whether this response may be written into a generation store
    ///
    /// Only successful 200 responses that stayed on the configured upstream
    /// origin qualify. Redirects that land off-origin behave like opaque
    /// responses: returned to the caller, never stored.
    pub fn is_cacheable_for(&self, upstream_origin: &str) -> bool {
        if self.status != 200 {
            return false;
        }
        match origin_of(&self.final_url) {
            Ok(origin) => origin == upstream_origin,
            Err(_) => false,
        }
    }

    pub fn into_stored(self) -> StoredResponse {
        StoredResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// A fetch that produced no response at all (no connectivity, DNS failure,
/// timeout). Distinct from an error response, which is a `FetchedResponse`.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub url: String,
    pub reason: String,
}

impl FetchFailure {
    pub fn into_error(self) -> CacheError {
        CacheError::NetworkUnavailable {
            url: self.url,
            reason: self.reason,
        }
    }
}

/// Trait for issuing network requests
///
/// Injected into the generation manager and router so bootstrap and routing
/// can be exercised without a live network.
#[async_trait::async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        key: &RequestKey,
        body: Option<Vec<u8>>,
    ) -> Result<FetchedResponse, FetchFailure>;
}

/// reqwest-backed fetcher used in production
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build the HTTP client with timeout and a bounded redirect policy
    ///
    /// An optional User-Agent can be supplied (to avoid bot detection on
    /// some upstreams).
    pub fn new(user_agent: Option<&str>) -> Result<Self, CacheError> {
        let mut client_builder = Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(5));

        if let Some(ua) = user_agent {
            client_builder = client_builder.user_agent(ua);
        }

        let client = client_builder
            .build()
            .map_err(|e| CacheError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(HttpFetcher { client })
    }
}

#[async_trait::async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        key: &RequestKey,
        body: Option<Vec<u8>>,
    ) -> Result<FetchedResponse, FetchFailure> {
        info!("🌐 Fetching {}", key);

        let method = reqwest::Method::from_bytes(key.method.as_bytes()).map_err(|e| {
            FetchFailure {
                url: key.url.clone(),
                reason: format!("Invalid method {}: {}", key.method, e),
            }
        })?;

        let mut request = self.client.request(method, &key.url);
        if let Some(bytes) = body {
            request = request.body(bytes);
        }

        let response = request.send().await.map_err(|e| FetchFailure {
            url: key.url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchFailure {
                url: key.url.clone(),
                reason: format!("Failed to read body: {}", e),
            })?
            .to_vec();

        debug!("Fetched {} bytes from {} (status {})", body.len(), final_url, status);

        Ok(FetchedResponse {
            status,
            headers,
            body,
            final_url,
        })
    }
}

/// Extract the origin (scheme + host + port) from a URL
pub fn origin_of(url: &str) -> Result<String, CacheError> {
    url::Url::parse(url)
        .map_err(|e| CacheError::InvalidUrl(format!("Failed to parse URL: {}", e)))
        .map(|parsed| {
            let scheme = parsed.scheme();
            let host = parsed.host_str().unwrap_or("");
            let port = parsed.port();
            if let Some(port) = port {
                format!("{}://{}:{}", scheme, host, port)
            } else {
                format!("{}://{}", scheme, host)
            }
        })
}
