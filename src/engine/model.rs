//! Model lifecycle: ordered fallback configurations, a load deadline and a
//! single shared load attempt for all concurrent callers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::engine::backend::{ModelBackend, ModelLoader};
use crate::engine::errors::{BackendError, BackendErrorKind, MatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

/// Snapshot of the manager for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: ModelState,
    pub model: Option<String>,
    pub dimensions: Option<usize>,
    pub last_error: Option<String>,
}

type LoadOutcome = Result<Arc<dyn ModelBackend>, MatchError>;

struct Slot {
    state: ModelState,
    backend: Option<Arc<dyn ModelBackend>>,
    last_error: Option<MatchError>,
    pending: Option<watch::Receiver<Option<LoadOutcome>>>,
    /// Bumped on every new attempt and on reset; stale attempts don't publish.
    generation: u64,
}

pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    configurations: Arc<Vec<String>>,
    load_timeout: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl ModelManager {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        configurations: Vec<String>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            loader,
            configurations: Arc::new(configurations),
            load_timeout,
            slot: Arc::new(Mutex::new(Slot {
                state: ModelState::Unloaded,
                backend: None,
                last_error: None,
                pending: None,
                generation: 0,
            })),
        }
    }

    pub fn state(&self) -> ModelState {
        lock_slot(&self.slot).state
    }

    /// The loaded backend, if any, without triggering a load.
    pub fn backend(&self) -> Option<Arc<dyn ModelBackend>> {
        lock_slot(&self.slot).backend.clone()
    }

    pub fn status(&self) -> ModelStatus {
        let slot = lock_slot(&self.slot);
        ModelStatus {
            state: slot.state,
            model: slot.backend.as_ref().map(|b| b.name().to_string()),
            dimensions: slot.backend.as_ref().map(|b| b.dimensions()),
            last_error: slot.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Return the ready backend, loading it if nothing has been attempted yet.
    ///
    /// Callers arriving while a load is in flight wait for that same attempt.
    /// After a failure the recorded error is returned until `reload()`.
    pub async fn ensure_ready(&self) -> LoadOutcome {
        let rx = {
            let mut slot = lock_slot(&self.slot);
            if let (ModelState::Ready, Some(backend)) = (slot.state, slot.backend.clone()) {
                return Ok(backend);
            }
            if slot.state == ModelState::Failed {
                return Err(slot.last_error.clone().unwrap_or(MatchError::ModelNotReady));
            }

            match (slot.state, slot.pending.clone()) {
                (ModelState::Loading, Some(rx)) => rx,
                _ => self.begin_load(&mut slot),
            }
        };

        wait_for_outcome(rx).await
    }

    /// Drop the current backend (or last failure) and load again.
    ///
    /// Joins the in-flight attempt instead if one is already running.
    pub async fn reload(&self) -> LoadOutcome {
        let rx = {
            let mut slot = lock_slot(&self.slot);
            match (slot.state, slot.pending.clone()) {
                (ModelState::Loading, Some(rx)) => rx,
                (state, _) => {
                    log::info!("reloading model (was {state:?})");
                    slot.backend = None;
                    slot.last_error = None;
                    self.begin_load(&mut slot)
                }
            }
        };

        wait_for_outcome(rx).await
    }

    /// Forget everything; an in-flight attempt finishes unobserved.
    pub fn reset(&self) {
        let mut slot = lock_slot(&self.slot);
        slot.state = ModelState::Unloaded;
        slot.backend = None;
        slot.last_error = None;
        slot.pending = None;
        slot.generation += 1;
    }

    fn begin_load(&self, slot: &mut Slot) -> watch::Receiver<Option<LoadOutcome>> {
        let (tx, rx) = watch::channel(None);

        slot.state = ModelState::Loading;
        slot.generation += 1;
        slot.pending = Some(rx.clone());

        let generation = slot.generation;
        let shared = self.slot.clone();
        let loader = self.loader.clone();
        let configurations = self.configurations.clone();
        let load_timeout = self.load_timeout;

        tokio::spawn(async move {
            let outcome = load_with_timeout(loader, configurations, load_timeout).await;

            {
                let mut slot = lock_slot(&shared);
                if slot.generation == generation {
                    slot.pending = None;
                    match &outcome {
                        Ok(backend) => {
                            slot.state = ModelState::Ready;
                            slot.backend = Some(backend.clone());
                            slot.last_error = None;
                        }
                        Err(err) => {
                            slot.state = ModelState::Failed;
                            slot.backend = None;
                            slot.last_error = Some(err.clone());
                        }
                    }
                } else {
                    log::debug!("discarding outcome of superseded model load #{generation}");
                }
            }

            // every waiter may have gone away already
            let _ = tx.send(Some(outcome));
        });

        rx
    }
}

fn lock_slot(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait_for_outcome(mut rx: watch::Receiver<Option<LoadOutcome>>) -> LoadOutcome {
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| MatchError::Internal("model load task ended without a result".into()))?;

    match &*outcome {
        Some(result) => result.clone(),
        None => Err(MatchError::ModelNotReady),
    }
}

/// Race the sequential attempts against the deadline. On timeout the blocking
/// attempt keeps running in the background and its result is ignored.
async fn load_with_timeout(
    loader: Arc<dyn ModelLoader>,
    configurations: Arc<Vec<String>>,
    load_timeout: Duration,
) -> LoadOutcome {
    let attempt =
        tokio::task::spawn_blocking(move || load_sequential(loader.as_ref(), &configurations));

    match tokio::time::timeout(load_timeout, attempt).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => Err(MatchError::Internal(format!(
            "model loader panicked: {join_err}"
        ))),
        Err(_) => {
            log::error!("model initialization timed out after {load_timeout:?}");
            Err(MatchError::InitializationTimeout(load_timeout))
        }
    }
}

fn load_sequential(loader: &dyn ModelLoader, configurations: &[String]) -> LoadOutcome {
    let mut failures = Vec::with_capacity(configurations.len());

    for name in configurations {
        log::info!("trying model configuration '{name}'");
        match loader.load(name) {
            Ok(backend) => {
                log::info!(
                    "model '{name}' initialized ({} dimensions)",
                    backend.dimensions()
                );
                return Ok(backend);
            }
            Err(err) => {
                log::warn!("failed to initialize model '{name}': {err}");
                failures.push(err);
            }
        }
    }

    Err(classify_failures(&failures))
}

/// Any out-of-memory failure wins; all-network means we are offline.
fn classify_failures(failures: &[BackendError]) -> MatchError {
    let Some(last) = failures.last() else {
        return MatchError::InitializationExhausted {
            attempts: 0,
            last: "no model configurations".to_string(),
        };
    };

    if let Some(oom) = failures.iter().find(|f| f.kind == BackendErrorKind::Memory) {
        return MatchError::InitializationMemory(oom.message.clone());
    }

    if failures.iter().all(|f| f.kind == BackendErrorKind::Network) {
        return MatchError::InitializationNetwork(last.message.clone());
    }

    MatchError::InitializationExhausted {
        attempts: failures.len(),
        last: last.message.clone(),
    }
}
