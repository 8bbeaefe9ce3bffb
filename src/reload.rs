//! Reload request signalling and the coordinator that owns the active module.

use crate::module::{BuildError, LoadError, Module, ModuleSource};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};

/// The only state shared between the change detector thread and the event loop.
///
/// Requests made before the loop gets around to [`ReloadFlag::take`] collapse
/// into a single reload.
#[derive(Debug, Clone, Default)]
pub struct ReloadFlag {
    inner: Arc<FlagInner>,
}

#[derive(Debug, Default)]
struct FlagInner {
    requested: Mutex<bool>,
    wake: Notify,
}

impl ReloadFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a reload as due and wakes the loop if it is waiting.
    pub fn request(&self) {
        *self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.inner.wake.notify_one();
    }

    /// Reads and clears the flag in one step.
    pub fn take(&self) -> bool {
        std::mem::take(
            &mut *self
                .inner
                .requested
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn is_requested(&self) -> bool {
        *self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves after the next [`ReloadFlag::request`], or immediately if one
    /// arrived since the last wait.
    pub async fn notified(&self) {
        self.inner.wake.notified().await
    }
}

/// Startup cannot fall back to a previous module, so either failure is fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("initial build failed: {0}")]
    Build(#[from] BuildError),
    #[error("initial load failed: {0}")]
    Load(#[from] LoadError),
}

/// Result of one reload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Swapped { generation: u64 },
    BuildFailed,
    LoadFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleHealth {
    Active,
    /// The last reload failed; the previous module is still serving.
    Degraded { reason: String },
    Unloaded,
}

/// Owns the active module and is the only thing that ever replaces it.
pub struct ReloadCoordinator {
    source: Box<dyn ModuleSource>,
    active: Option<Box<dyn Module>>,
    generation: u64,
    last_failure: Option<String>,
}

impl ReloadCoordinator {
    pub fn new(source: Box<dyn ModuleSource>) -> Self {
        Self {
            source,
            active: None,
            generation: 0,
            last_failure: None,
        }
    }

    /// Builds (unless `build` is false) and loads the first module.
    pub fn initial_load(&mut self, build: bool) -> Result<(), StartupError> {
        if build {
            self.source.build()?;
        }
        let module = self.source.load()?;
        self.swap(module);
        info!("Module generation {} active", self.generation);
        Ok(())
    }

    /// Rebuilds and, if the new unit loads, swaps it in.
    ///
    /// The previous module stays active until its replacement is fully
    /// loaded, so a failed load leaves the host serving the old code.
    pub fn reload_cycle(&mut self) -> ReloadOutcome {
        info!("Reloading handlers...");
        if let Err(e) = self.source.build() {
            warn!("Rebuild failed, keeping generation {}: {}", self.generation, e);
            self.last_failure = Some(e.to_string());
            return ReloadOutcome::BuildFailed;
        }
        match self.source.load() {
            Ok(module) => {
                self.swap(module);
                info!("Reloaded, generation {} active", self.generation);
                ReloadOutcome::Swapped {
                    generation: self.generation,
                }
            }
            Err(e) => {
                warn!(
                    "New module failed to load, keeping generation {}: {}",
                    self.generation, e
                );
                self.last_failure = Some(e.to_string());
                ReloadOutcome::LoadFailed
            }
        }
    }

    /// Publish, notify, then release the old unit.
    fn swap(&mut self, module: Box<dyn Module>) {
        let previous = self.active.replace(module);
        self.generation += 1;
        self.last_failure = None;
        if let Some(active) = self.active.as_deref() {
            active.on_swap();
        }
        drop(previous);
    }

    pub fn active(&self) -> Option<&dyn Module> {
        self.active.as_deref()
    }

    /// Starts at 0, becomes 1 after the initial load and grows by one per swap.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn health(&self) -> ModuleHealth {
        match (&self.active, &self.last_failure) {
            (None, _) => ModuleHealth::Unloaded,
            (Some(_), Some(reason)) => ModuleHealth::Degraded {
                reason: reason.clone(),
            },
            (Some(_), None) => ModuleHealth::Active,
        }
    }

    /// Drops the active module. Returns whether there was one.
    pub fn release(&mut self) -> bool {
        self.active.take().is_some()
    }
}
