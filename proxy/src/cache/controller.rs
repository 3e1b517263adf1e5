//! Bootstrap/teardown sequencing for the proxy
//!
//! Install seeds the current generation from the manifest; activation
//! retires stale generations and claims clients. The generation id and
//! manifest are injected at construction, never held as ambient state.

use crate::cache::generation::{GenerationManager, PopulateReport};
use crate::cache::{CacheError, GenerationId};
use crate::config::Manifest;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle phases of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Initial state, and the state after a failed install
    Uninstalled,
    Installing,
    Installed,
    Activating,
    Active,
}

/// Drives the proxy through install → activate and publishes the current
/// generation to routers at claim time
pub struct LifecycleController {
    generation: GenerationId,
    manifest: Manifest,
    manager: GenerationManager,
    state: Mutex<LifecycleState>,
    active_tx: watch::Sender<Option<GenerationId>>,
}

impl LifecycleController {
    pub fn new(generation: GenerationId, manifest: Manifest, manager: GenerationManager) -> Self {
        let (active_tx, _) = watch::channel(None);
        LifecycleController {
            generation,
            manifest,
            manager,
            state: Mutex::new(LifecycleState::Uninstalled),
            active_tx,
        }
    }

    /// Receiver side of the claim channel; routers hold one and treat
    /// `None` as "client not yet claimed"
    pub fn subscribe(&self) -> watch::Receiver<Option<GenerationId>> {
        self.active_tx.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    pub fn generation(&self) -> &GenerationId {
        &self.generation
    }

    fn transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            return Err(CacheError::Lifecycle(format!(
                "Cannot move to {:?} from {:?} (requires {:?})",
                to, *state, from
            )));
        }
        *state = to;
        Ok(())
    }

    fn force(&self, to: LifecycleState) {
        *self.state.lock().unwrap() = to;
    }

    /// Install the proxy: populate the current generation from the manifest
    ///
    /// Blocks until every manifest entry has settled. On failure the proxy
    /// returns to `Uninstalled` so the platform can re-invoke install on a
    /// later load.
    pub async fn install(&self) -> Result<PopulateReport, CacheError> {
        self.transition(LifecycleState::Uninstalled, LifecycleState::Installing)?;
        info!("⚙️ Installing generation {}", self.generation);

        match self.manager.populate(&self.generation, &self.manifest).await {
            Ok(report) => {
                self.force(LifecycleState::Installed);
                info!("Install complete: generation {} ready", self.generation);
                Ok(report)
            }
            Err(e) => {
                self.force(LifecycleState::Uninstalled);
                warn!("Install of generation {} failed: {}", self.generation, e);
                Err(e)
            }
        }
    }

    /// Activate the proxy: retire stale generations, then claim clients
    ///
    /// Claiming publishes the current generation over the watch channel so
    /// already-open clients are routed through it immediately instead of
    /// waiting for their next load. Returns the retired generation names.
    pub async fn activate(&self) -> Result<Vec<String>, CacheError> {
        self.transition(LifecycleState::Installed, LifecycleState::Activating)?;
        info!("Activating generation {}", self.generation);

        let retired = match self.manager.retire_stale(&self.generation).await {
            Ok(retired) => retired,
            Err(e) => {
                // Activation cannot proceed without generation enumeration
                self.force(LifecycleState::Installed);
                return Err(e);
            }
        };

        self.active_tx.send_replace(Some(self.generation.clone()));
        self.force(LifecycleState::Active);
        info!(
            "Generation {} active, clients claimed ({} stale generations retired)",
            self.generation,
            retired.len()
        );
        Ok(retired)
    }
}
