//! Proxy configuration: generation id, manifest, upstream origin and
//! routing predicates
//!
//! Everything the lifecycle needs is carried explicitly in `ProxyConfig`
//! rather than ambient state, so bootstrap and activation can be driven
//! deterministically in tests.

use crate::cache::fetcher::origin_of;
use crate::cache::{CacheError, GenerationId};
use std::env;
use std::fs;
use std::path::Path;
use tracing::info;

/// Hosts whose requests must always bypass the cache when no explicit
/// exclusion list is configured. Real-time signaling traffic is
/// session-specific and must always go live.
pub const DEFAULT_EXCLUDED_HOSTS: &[&str] = &["signaling."];

/// The fixed list of resources guaranteed present in a generation after a
/// successful bootstrap
///
/// Ordered for deterministic fetch sequencing, but a set semantically:
/// duplicates are dropped, first occurrence wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<String>,
}

impl Manifest {
    pub fn new<I, S>(locators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = Vec::new();
        for locator in locators {
            let locator = locator.into();
            if !entries.contains(&locator) {
                entries.push(locator);
            }
        }
        Manifest { entries }
    }

    /// Parse a manifest from either of its two text forms
    ///
    /// A JSON string array (`["/index.html", ...]`) or newline-delimited
    /// locators. In the newline form, blank lines and `#` comments are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, CacheError> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('[') {
            let locators: Vec<String> = serde_json::from_str(trimmed)
                .map_err(|e| CacheError::Config(format!("Invalid manifest JSON: {}", e)))?;
            return Ok(Manifest::new(locators));
        }

        let locators = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string);
        Ok(Manifest::new(locators))
    }

    /// Load a manifest from a file in either text form
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let text = fs::read_to_string(path.as_ref())?;
        let manifest = Manifest::parse(&text)?;
        info!(
            "Loaded manifest with {} entries from {}",
            manifest.len(),
            path.as_ref().display()
        );
        Ok(manifest)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Configuration for one deployment of the proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Name of the cache generation this deployment serves. Operators bump
    /// it to force cache invalidation on the next deploy.
    pub generation_id: GenerationId,
    /// Assets seeded into the generation at bootstrap
    pub manifest: Manifest,
    /// Origin that relative manifest locators and incoming request paths
    /// resolve against (scheme + host + port, no trailing slash)
    pub upstream_origin: String,
    /// Substrings matched against request URL hostnames to identify
    /// always-live endpoints
    pub excluded_hosts: Vec<String>,
    /// Optional locator served from the current store when a cache miss
    /// cannot reach the network (e.g. "/offline.html")
    pub fallback_page: Option<String>,
    /// Optional User-Agent for upstream fetches
    pub user_agent: Option<String>,
}

impl ProxyConfig {
    pub fn new(
        generation_id: GenerationId,
        manifest: Manifest,
        upstream_origin: &str,
    ) -> Result<Self, CacheError> {
        // Normalize so origin comparisons are exact string equality
        let upstream_origin = origin_of(upstream_origin)?;
        Ok(ProxyConfig {
            generation_id,
            manifest,
            upstream_origin,
            excluded_hosts: DEFAULT_EXCLUDED_HOSTS.iter().map(|s| s.to_string()).collect(),
            fallback_page: None,
            user_agent: None,
        })
    }

    /// Load configuration from CACHEFRONT_* environment variables
    ///
    /// Required: CACHEFRONT_GENERATION, CACHEFRONT_MANIFEST (path),
    /// CACHEFRONT_UPSTREAM. Optional: CACHEFRONT_EXCLUDED_HOSTS
    /// (comma-separated), CACHEFRONT_FALLBACK_PAGE, CACHEFRONT_USER_AGENT.
    pub fn from_env() -> Result<Self, CacheError> {
        let generation = env::var("CACHEFRONT_GENERATION")
            .map_err(|_| CacheError::Config("CACHEFRONT_GENERATION is not set".to_string()))?;
        let manifest_path = env::var("CACHEFRONT_MANIFEST")
            .map_err(|_| CacheError::Config("CACHEFRONT_MANIFEST is not set".to_string()))?;
        let upstream = env::var("CACHEFRONT_UPSTREAM")
            .map_err(|_| CacheError::Config("CACHEFRONT_UPSTREAM is not set".to_string()))?;

        let manifest = Manifest::load(&manifest_path)?;
        let mut config = ProxyConfig::new(GenerationId::new(generation), manifest, &upstream)?;

        if let Ok(hosts) = env::var("CACHEFRONT_EXCLUDED_HOSTS") {
            config.excluded_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(page) = env::var("CACHEFRONT_FALLBACK_PAGE") {
            config.fallback_page = Some(page);
        }
        if let Ok(ua) = env::var("CACHEFRONT_USER_AGENT") {
            config.user_agent = Some(ua);
        }

        Ok(config)
    }

    /// Whether a request URL targets an endpoint that must always bypass
    /// the cache
    ///
    /// Patterns match the URL's hostname only, so a path like
    /// /docs/signaling.setup.html on the upstream never trips the
    /// exclusion.
    pub fn is_excluded(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.excluded_hosts.iter().any(|pattern| host.contains(pattern.as_str()))
    }

    /// Resolve a manifest locator to an absolute URL
    ///
    /// Absolute URLs pass through; relative paths are joined onto the
    /// upstream origin.
    pub fn resolve_locator(&self, locator: &str) -> Result<String, CacheError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return Ok(locator.to_string());
        }
        let base = url::Url::parse(&self.upstream_origin)
            .map_err(|e| CacheError::InvalidUrl(format!("Bad upstream origin: {}", e)))?;
        let joined = base
            .join(locator)
            .map_err(|e| CacheError::InvalidUrl(format!("Bad locator {}: {}", locator, e)))?;
        Ok(joined.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProxyConfig {
        ProxyConfig::new(
            GenerationId::new("v1"),
            Manifest::new(["/index.html"]),
            "http://app.example.com",
        )
        .unwrap()
    }

    #[test]
    fn test_manifest_parse_newline_form() {
        let manifest = Manifest::parse(
            "# offline assets\n/index.html\n\n/style.css\nhttps://cdn.example.com/lib.js\n",
        )
        .unwrap();
        assert_eq!(
            manifest.entries(),
            &[
                "/index.html".to_string(),
                "/style.css".to_string(),
                "https://cdn.example.com/lib.js".to_string(),
            ]
        );
    }

    #[test]
    fn test_manifest_parse_json_form() {
        let manifest = Manifest::parse(r#"["/index.html", "/style.css"]"#).unwrap();
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn test_manifest_deduplicates_preserving_order() {
        let manifest = Manifest::new(["/a", "/b", "/a", "/c", "/b"]);
        assert_eq!(
            manifest.entries(),
            &["/a".to_string(), "/b".to_string(), "/c".to_string()]
        );
    }

    #[test]
    fn test_default_exclusion_matches_signaling_host() {
        let config = config();
        assert!(config.is_excluded("https://signaling.example.com/peer"));
        assert!(!config.is_excluded("http://app.example.com/index.html"));
    }

    #[test]
    fn test_exclusion_ignores_pattern_in_path_or_query() {
        let config = config();
        assert!(!config.is_excluded("http://app.example.com/docs/signaling.setup.html"));
        assert!(!config.is_excluded("http://app.example.com/search?q=signaling."));
    }

    #[test]
    fn test_resolve_locator() {
        let config = config();
        assert_eq!(
            config.resolve_locator("/photo.png").unwrap(),
            "http://app.example.com/photo.png"
        );
        assert_eq!(
            config.resolve_locator("https://cdn.example.com/lib.js").unwrap(),
            "https://cdn.example.com/lib.js"
        );
    }

    #[test]
    fn test_new_normalizes_upstream_origin() {
        let config = ProxyConfig::new(
            GenerationId::new("v1"),
            Manifest::new(["/index.html"]),
            "http://app.example.com/some/path",
        )
        .unwrap();
        assert_eq!(config.upstream_origin, "http://app.example.com");
    }
}
