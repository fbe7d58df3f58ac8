//! Worker lifecycle: install, activate, garbage-collect stale generations.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures::future::try_join_all;
use swkit_net::{Fetcher, Request};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ServiceWorkerError;
use crate::store::{Generation, RequestKey, StoredResponse, VersionedStore};

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Created, not yet installed.
    #[default]
    Parsed,
    /// Populating the precache.
    Installing,
    /// Installed, waiting for activation.
    Waiting,
    /// Removing stale generations.
    Activating,
    /// Active and intercepting fetches.
    Active,
    /// Install failed; this worker is discarded.
    Redundant,
}

impl WorkerState {
    /// Check if this state allows fetch interception.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, WorkerState::Active)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Parsed => write!(f, "parsed"),
            WorkerState::Installing => write!(f, "installing"),
            WorkerState::Waiting => write!(f, "waiting"),
            WorkerState::Activating => write!(f, "activating"),
            WorkerState::Active => write!(f, "active"),
            WorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

/// Lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        generation: Generation,
        new_state: WorkerState,
    },
    /// Every manifest entry was committed.
    PrecacheCompleted {
        generation: Generation,
        entries: usize,
    },
    /// A stale generation was removed during activation.
    GenerationDeleted { generation: Generation },
    /// A stale generation could not be removed; it lingers until the next activation.
    GenerationDeleteFailed { generation: Generation, error: String },
}

/// What activation cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub deleted: Vec<Generation>,
    pub failed: Vec<Generation>,
}

#[derive(Debug)]
struct StateCell {
    state: WorkerState,
    changed_at: Instant,
    /// Set once any install has committed the whole manifest.
    installed: bool,
    installs_running: usize,
}

/// Drives a worker through install and activate for one target generation.
pub struct LifecycleController {
    generation: Generation,
    manifest: Vec<Url>,
    store: VersionedStore,
    fetcher: Arc<dyn Fetcher>,
    state: RwLock<StateCell>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl LifecycleController {
    /// Create a controller and the receiving end of its event channel.
    pub fn new(
        generation: Generation,
        manifest: Vec<Url>,
        store: VersionedStore,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                generation,
                manifest,
                store,
                fetcher,
                state: RwLock::new(StateCell {
                    state: WorkerState::Parsed,
                    changed_at: Instant::now(),
                    installed: false,
                    installs_running: 0,
                }),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn manifest(&self) -> &[Url] {
        &self.manifest
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Time of last state change.
    pub fn state_changed_at(&self) -> Instant {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .changed_at
    }

    /// Apply `update` to the state cell under one write lock, then publish
    /// the new state if it changed.
    fn transition<T>(&self, update: impl FnOnce(&mut StateCell) -> T) -> T {
        let (result, changed) = {
            let mut cell = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let before = cell.state;
            let result = update(&mut *cell);
            let changed = if cell.state != before {
                cell.changed_at = Instant::now();
                Some(cell.state)
            } else {
                None
            };
            (result, changed)
        };

        if let Some(new_state) = changed {
            debug!(generation = %self.generation, state = %new_state, "Worker state changed");
            let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
                generation: self.generation.clone(),
                new_state,
            });
        }
        result
    }

    /// Populate the target generation with the whole manifest.
    ///
    /// All entries are fetched before anything is written, then committed in
    /// one batch. Re-running overwrites entries by key.
    ///
    /// The worker becomes redundant only when no install has ever succeeded
    /// and no other install is still running. A failed retry of an installed
    /// worker leaves its state alone.
    pub async fn install(&self) -> Result<usize, ServiceWorkerError> {
        self.transition(|cell| match cell.state {
            WorkerState::Activating => Err(ServiceWorkerError::StateError(
                "Cannot install while activating".to_string(),
            )),
            WorkerState::Redundant => Err(ServiceWorkerError::StateError(
                "Cannot install a redundant worker".to_string(),
            )),
            state => {
                cell.installs_running += 1;
                if state == WorkerState::Parsed {
                    cell.state = WorkerState::Installing;
                }
                Ok(())
            }
        })?;
        info!(generation = %self.generation, entries = self.manifest.len(), "Installing");

        let result = self.populate().await;

        self.transition(|cell| {
            cell.installs_running -= 1;
            match &result {
                Ok(_) => {
                    cell.installed = true;
                    if cell.state == WorkerState::Installing {
                        cell.state = WorkerState::Waiting;
                    }
                }
                Err(_) if !cell.installed && cell.installs_running == 0 => {
                    cell.state = WorkerState::Redundant;
                }
                Err(_) => {}
            }
        });

        match result {
            Ok(entries) => {
                info!(generation = %self.generation, entries, "Precache complete");
                let _ = self.event_tx.send(ServiceWorkerEvent::PrecacheCompleted {
                    generation: self.generation.clone(),
                    entries,
                });
                Ok(entries)
            }
            Err(e) => {
                warn!(generation = %self.generation, error = %e, "Install failed");
                Err(e)
            }
        }
    }

    async fn populate(&self) -> Result<usize, ServiceWorkerError> {
        let entries = try_join_all(self.manifest.iter().map(|url| self.precache_one(url))).await?;
        let count = entries.len();

        let commit_error = |source| ServiceWorkerError::PrecacheCommit {
            generation: self.generation.to_string(),
            source,
        };
        let cache = self.store.open(&self.generation).await.map_err(commit_error)?;
        cache.put_all(entries).await.map_err(commit_error)?;

        Ok(count)
    }

    async fn precache_one(&self, url: &Url) -> Result<(RequestKey, StoredResponse), ServiceWorkerError> {
        let failed = |reason: String| ServiceWorkerError::PrecacheFailed {
            url: url.to_string(),
            reason,
        };

        let request = Request::get(url.clone());
        let key = RequestKey::for_request(&request);
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.ok() {
            return Err(failed(format!("status {}", response.status)));
        }

        let stored = StoredResponse::capture(response)
            .await
            .map_err(|e| failed(e.to_string()))?;
        debug!(key = %key, bytes = stored.size(), "Precached");
        Ok((key, stored))
    }

    /// Delete every generation but the target, then become active.
    ///
    /// Allowed once installed; repeating it on an active worker is a no-op
    /// apart from another cleanup pass.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        self.transition(|cell| match cell.state {
            WorkerState::Waiting | WorkerState::Activating => {
                cell.state = WorkerState::Activating;
                Ok(())
            }
            WorkerState::Active => Ok(()),
            other => Err(ServiceWorkerError::StateError(format!(
                "Cannot activate a worker in state {other}"
            ))),
        })?;

        let mut report = ActivationReport::default();
        match self.store.generations().await {
            Ok(generations) => {
                for stale in generations.into_iter().filter(|g| *g != self.generation) {
                    self.delete_stale(stale, &mut report).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not enumerate generations; stale generations kept");
            }
        }

        self.transition(|cell| cell.state = WorkerState::Active);
        info!(
            generation = %self.generation,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Activated"
        );
        Ok(report)
    }

    async fn delete_stale(&self, stale: Generation, report: &mut ActivationReport) {
        match self.store.delete_generation(&stale).await {
            Ok(true) => {
                info!(generation = %stale, "Deleted stale generation");
                let _ = self.event_tx.send(ServiceWorkerEvent::GenerationDeleted {
                    generation: stale.clone(),
                });
                report.deleted.push(stale);
            }
            // Already removed by a concurrent activation.
            Ok(false) => {}
            Err(e) => {
                warn!(generation = %stale, error = %e, "Failed to delete stale generation");
                let _ = self.event_tx.send(ServiceWorkerEvent::GenerationDeleteFailed {
                    generation: stale.clone(),
                    error: e.to_string(),
                });
                report.failed.push(stale);
            }
        }
    }
}
