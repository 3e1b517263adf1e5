//! Offline caching proxy core
//!
//! This module provides versioned cache generations, a manifest-seeded
//! bootstrap, and cache-first request routing with asynchronous write-back.

pub mod controller;
pub mod fetcher;
pub mod generation;
pub mod memory;
pub mod router;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type for cache proxy operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Manifest fetch failed for {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    #[error("Network unavailable for {url}: {reason}")]
    NetworkUnavailable { url: String, reason: String },

    #[error("Failed to delete generation {generation}: {reason}")]
    StoreDeletion { generation: String, reason: String },

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

/// Identifier naming one versioned cache generation
///
/// Opaque to the proxy; operators bump it in configuration to force cache
/// invalidation on the next deploy. Exactly one generation is current at a
/// time after activation; all others are stale and eligible for retirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationId(String);

impl GenerationId {
    pub fn new(id: impl Into<String>) -> Self {
        GenerationId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request identity used as the store key: method plus absolute URL,
/// query string included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        RequestKey {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Shorthand for the common GET identity
    pub fn get(url: impl Into<String>) -> Self {
        RequestKey::new("GET", url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A response persisted in a generation's store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers, in arrival order
    pub headers: Vec<(String, String)>,
    /// Response body bytes
    pub body: Vec<u8>,
}

/// Trait for one generation's key/value response store
///
/// Each store is named by a generation id and persists across process
/// restarts until its generation is deleted. Mutations are atomic per key.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a stored response by request identity
    async fn get(&self, key: &RequestKey) -> Result<Option<StoredResponse>, CacheError>;

    /// Store a response under a request identity
    ///
    /// Replaces any existing entry for the same key. Must be independently
    /// durable: a suspend between puts never leaves a torn entry.
    async fn put(&self, key: &RequestKey, response: &StoredResponse) -> Result<(), CacheError>;

    /// Number of entries in this store
    async fn len(&self) -> Result<usize, CacheError>;

    /// All request identities currently stored
    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError>;
}

/// Trait for the backend that owns all generation stores
///
/// This abstraction allows for different storage backends (SQLite,
/// in-memory, etc.) while maintaining a consistent interface for
/// generation lifecycle management.
#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync {
    /// Open the store named by `generation`, creating it if absent
    ///
    /// Opening registers the generation even while it is still empty, so a
    /// bootstrap interrupted mid-population leaves a discoverable (and
    /// deletable) generation behind.
    async fn open(&self, generation: &GenerationId) -> Result<Arc<dyn CacheStore>, CacheError>;

    /// Enumerate all existing generation names
    async fn list_generations(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a generation and its entire store
    ///
    /// Atomic from the caller's perspective: no partial-generation state
    /// is observable afterwards.
    async fn delete_generation(&self, generation: &GenerationId) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_key_uppercases_method() {
        let key = RequestKey::new("get", "http://app.example.com/index.html");
        assert_eq!(key.method, "GET");
        assert_eq!(key.to_string(), "GET http://app.example.com/index.html");
    }

    #[test]
    fn request_key_keeps_query() {
        let key = RequestKey::get("http://app.example.com/api?page=2");
        assert!(key.url.ends_with("?page=2"));
    }
}
