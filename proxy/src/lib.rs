pub mod cache;
pub mod config;
pub mod server;

// Re-export commonly used types
pub use cache::controller::{LifecycleController, LifecycleState};
pub use cache::fetcher::{Fetch, FetchFailure, FetchedResponse, HttpFetcher};
pub use cache::generation::{GenerationManager, PopulateReport};
pub use cache::memory::MemoryStoreBackend;
pub use cache::router::{RequestRouter, RouteSource, RoutedResponse};
pub use cache::sqlite::SqliteStoreBackend;
pub use cache::{CacheError, CacheStore, GenerationId, RequestKey, StoreBackend, StoredResponse};
pub use config::{Manifest, ProxyConfig};

use std::sync::Arc;

pub type AppState = Arc<ProxyState>;

/// Shared state for the HTTP surface
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    pub controller: LifecycleController,
    pub router: RequestRouter,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("generation", self.controller.generation())
            .field("state", &self.controller.state())
            .field("upstream_origin", &self.config.upstream_origin)
            .finish()
    }
}
