//! Cache generation lifecycle: manifest population and stale retirement
//!
//! Versioning works by naming a fresh store per generation rather than
//! mutating one in place. Cutover is atomic (readers never see a
//! half-upgraded asset set) and rollback is "don't delete the old name yet".

use crate::cache::fetcher::Fetch;
use crate::cache::{CacheError, CacheStore, GenerationId, RequestKey, StoreBackend};
use crate::config::{Manifest, ProxyConfig};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a successful populate
#[derive(Debug, Clone)]
pub struct PopulateReport {
    pub generation: GenerationId,
    pub entries: usize,
}

/// Owns cache-set versioning: seeds the current generation from the
/// manifest and retires every other generation.
pub struct GenerationManager {
    backend: Arc<dyn StoreBackend>,
    fetcher: Arc<dyn Fetch>,
    config: Arc<ProxyConfig>,
}

impl GenerationManager {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        fetcher: Arc<dyn Fetch>,
        config: Arc<ProxyConfig>,
    ) -> Self {
        GenerationManager {
            backend,
            fetcher,
            config,
        }
    }

    /// Fetch every manifest entry into the store named by `generation`
    ///
    /// All-or-nothing: the first entry that cannot be fetched or stored
    /// aborts the attempt with `ManifestFetch`. A generation this attempt
    /// created is deleted on failure so no partial generation stays
    /// reachable; a generation that existed before the attempt is kept,
    /// so a re-install with the network down never destroys a durable
    /// store. A pre-existing generation that already holds every manifest
    /// entry short-circuits without touching the network. Retry is the
    /// platform's responsibility, not ours.
    pub async fn populate(
        &self,
        generation: &GenerationId,
        manifest: &Manifest,
    ) -> Result<PopulateReport, CacheError> {
        let pre_existing = self
            .backend
            .list_generations()
            .await?
            .iter()
            .any(|name| name == generation.as_str());
        let store = self.backend.open(generation).await?;

        if pre_existing && self.is_complete(store.as_ref(), manifest).await? {
            info!(
                "Generation {} already holds all {} manifest entries, skipping fetch",
                generation,
                manifest.len()
            );
            return Ok(PopulateReport {
                generation: generation.clone(),
                entries: manifest.len(),
            });
        }

        info!(
            "📦 Populating generation {} with {} manifest entries",
            generation,
            manifest.len()
        );

        for locator in manifest.entries() {
            let url = self.config.resolve_locator(locator)?;
            let key = RequestKey::get(&url);

            let result = match self.fetcher.fetch(&key, None).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    store.put(&key, &response.into_stored()).await
                }
                Ok(response) => Err(CacheError::ManifestFetch {
                    url: url.clone(),
                    reason: format!("Unexpected status {}", response.status),
                }),
                Err(failure) => Err(CacheError::ManifestFetch {
                    url: url.clone(),
                    reason: failure.reason,
                }),
            };

            if let Err(e) = result {
                if pre_existing {
                    warn!(
                        "Manifest entry {} failed, keeping pre-existing generation {}",
                        url, generation
                    );
                } else {
                    warn!("Manifest entry {} failed, abandoning generation {}", url, generation);
                    if let Err(cleanup) = self.backend.delete_generation(generation).await {
                        warn!("Failed to clean up abandoned generation {}: {}", generation, cleanup);
                    }
                }
                return Err(match e {
                    err @ CacheError::ManifestFetch { .. } => err,
                    other => CacheError::ManifestFetch {
                        url,
                        reason: other.to_string(),
                    },
                });
            }
            debug!("Seeded {}", key);
        }

        info!("✅ Generation {} populated", generation);
        Ok(PopulateReport {
            generation: generation.clone(),
            entries: manifest.len(),
        })
    }

    /// Whether the store already holds an entry for every manifest locator
    async fn is_complete(
        &self,
        store: &dyn CacheStore,
        manifest: &Manifest,
    ) -> Result<bool, CacheError> {
        let present: HashSet<RequestKey> = store.keys().await?.into_iter().collect();
        for locator in manifest.entries() {
            let url = self.config.resolve_locator(locator)?;
            if !present.contains(&RequestKey::get(url)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Delete every generation whose name differs from `current`
    ///
    /// Best-effort: a generation that fails to delete is reported and
    /// skipped, the rest are still retired. Never touches the current
    /// generation. A second invocation with no stale generations left is
    /// a no-op.
    pub async fn retire_stale(&self, current: &GenerationId) -> Result<Vec<String>, CacheError> {
        let mut retired = Vec::new();

        for name in self.backend.list_generations().await? {
            if name == current.as_str() {
                continue;
            }
            match self.backend.delete_generation(&GenerationId::new(&name)).await {
                Ok(()) => {
                    info!("🧹 Retired stale generation {}", name);
                    retired.push(name);
                }
                Err(e) => {
                    let report = CacheError::StoreDeletion {
                        generation: name,
                        reason: e.to_string(),
                    };
                    warn!("{}", report);
                }
            }
        }

        Ok(retired)
    }
}
