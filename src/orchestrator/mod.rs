//! Core orchestrator implementation split into focused submodules.
//!
//! The `MergeOrchestrator` struct and its methods are organized by domain:
//! - [`submit`] - Task submission (validation, authorization, enqueue)
//! - [`control`] - Task lifecycle control (cancel, status, history, scopes)
//! - [`queue_processor`] - Queue processing and worker spawning
//! - [`task_worker`] - Core stage execution (fetch, merge, publish)

mod control;
mod queue_processor;
mod submit;
mod task_worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

use crate::auth::{AuthorizationGate, DbAuthGate};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::fetch::{HttpSourceFetcher, SourceFetcher};
use crate::merge::{FfmpegMergeEngine, MergeEngine};
use crate::publish::{Destination, GofileDestination};
use crate::types::{OwnerScope, Source, TaskId};

/// Queue and active-task state management
#[derive(Clone)]
pub(crate) struct QueueState {
    /// FIFO queue of accepted tasks waiting for a worker slot
    pub(crate) queue:
        std::sync::Arc<tokio::sync::Mutex<std::collections::VecDeque<QueuedTask>>>,
    /// Semaphore bounding concurrently active tasks (max_concurrent_tasks)
    pub(crate) concurrent_limit: std::sync::Arc<tokio::sync::Semaphore>,
    /// Map of active tasks to their cancellation tokens
    pub(crate) active_tasks: std::sync::Arc<
        tokio::sync::Mutex<
            std::collections::HashMap<TaskId, tokio_util::sync::CancellationToken>,
        >,
    >,
    /// Flag cleared during shutdown so new submissions are refused
    pub(crate) accepting_new: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

/// Pipeline stage implementations, all injectable at construction time
#[derive(Clone)]
pub(crate) struct StageSet {
    /// Source fetchers, consulted in registration order per source
    pub(crate) fetchers: std::sync::Arc<Vec<std::sync::Arc<dyn SourceFetcher>>>,
    /// External merge engine
    pub(crate) engine: std::sync::Arc<dyn MergeEngine>,
    /// Delivery destinations for merged artifacts
    pub(crate) destinations: std::sync::Arc<Vec<std::sync::Arc<dyn Destination>>>,
    /// Submission authorization gate
    pub(crate) auth: std::sync::Arc<dyn AuthorizationGate>,
}

/// Main orchestrator instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct MergeOrchestrator {
    /// Database instance for persistence
    /// Public for integration tests to query task state
    pub db: std::sync::Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<crate::types::Event>,
    /// Configuration
    pub(crate) config: std::sync::Arc<Config>,
    /// Queue and active-task state
    pub(crate) queue_state: QueueState,
    /// Injected stage implementations
    pub(crate) stages: StageSet,
}

/// A task waiting in the FIFO queue
#[derive(Debug, Clone)]
pub(crate) struct QueuedTask {
    pub(crate) id: TaskId,
    pub(crate) owner_scope: OwnerScope,
    pub(crate) inputs: Vec<Source>,
}

/// Builder for [`MergeOrchestrator`] with injectable stage implementations
///
/// Defaults: HTTP fetcher with the gofile resolver, ffmpeg merge engine
/// (discovered per the merge config), gofile destination, and the
/// database-backed allow-list gate.
pub struct MergeOrchestratorBuilder {
    config: Config,
    fetchers: Vec<std::sync::Arc<dyn SourceFetcher>>,
    engine: Option<std::sync::Arc<dyn MergeEngine>>,
    destinations: Vec<std::sync::Arc<dyn Destination>>,
    auth: Option<std::sync::Arc<dyn AuthorizationGate>>,
}

impl MergeOrchestratorBuilder {
    /// Register a source fetcher (e.g. for platform file refs)
    ///
    /// Fetchers are consulted in registration order; the first one that
    /// supports a source wins. If no fetcher is registered explicitly, the
    /// default HTTP fetcher is used.
    pub fn with_fetcher(mut self, fetcher: std::sync::Arc<dyn SourceFetcher>) -> Self {
        self.fetchers.push(fetcher);
        self
    }

    /// Replace the merge engine
    pub fn with_merge_engine(mut self, engine: std::sync::Arc<dyn MergeEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Register a delivery destination
    ///
    /// If at least one destination is registered explicitly, the default
    /// gofile destination is not added.
    pub fn with_destination(mut self, destination: std::sync::Arc<dyn Destination>) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Replace the authorization gate
    pub fn with_auth_gate(mut self, auth: std::sync::Arc<dyn AuthorizationGate>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Build the orchestrator: open the database, fail tasks interrupted by
    /// the previous run, and wire up defaults for anything not injected
    pub async fn build(self) -> Result<MergeOrchestrator> {
        let config = self.config;

        tokio::fs::create_dir_all(&config.storage.work_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create work directory '{}': {}",
                        config.storage.work_dir.display(),
                        e
                    ),
                ))
            })?;

        let db = Database::new(&config.storage.database_path).await?;

        // A merge interrupted mid-run is not resumable: anything non-terminal
        // from the previous session is failed up front
        let interrupted = db.fail_interrupted_tasks().await?;
        if interrupted > 0 {
            tracing::warn!(
                count = interrupted,
                "Failed tasks interrupted by previous shutdown"
            );
        }

        let (event_tx, _rx) = tokio::sync::broadcast::channel(config.event_capacity);

        let mut fetchers = self.fetchers;
        if fetchers.is_empty() {
            fetchers.push(std::sync::Arc::new(
                HttpSourceFetcher::new(&config.limits).map_err(Error::SourceFetch)?,
            ));
        }

        let engine: std::sync::Arc<dyn MergeEngine> = match self.engine {
            Some(engine) => engine,
            None => std::sync::Arc::new(FfmpegMergeEngine::discover(&config.merge)?),
        };

        let mut destinations = self.destinations;
        if destinations.is_empty() {
            destinations.push(std::sync::Arc::new(GofileDestination::new(
                reqwest::Client::new(),
            )));
        }

        let db = std::sync::Arc::new(db);

        let auth: std::sync::Arc<dyn AuthorizationGate> = match self.auth {
            Some(auth) => auth,
            None => std::sync::Arc::new(DbAuthGate::new((*db).clone(), config.owner_scope)),
        };

        let queue_state = QueueState {
            queue: std::sync::Arc::new(tokio::sync::Mutex::new(
                std::collections::VecDeque::new(),
            )),
            concurrent_limit: std::sync::Arc::new(tokio::sync::Semaphore::new(
                config.limits.max_concurrent_tasks,
            )),
            active_tasks: std::sync::Arc::new(tokio::sync::Mutex::new(
                std::collections::HashMap::new(),
            )),
            accepting_new: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)),
        };

        let stages = StageSet {
            fetchers: std::sync::Arc::new(fetchers),
            engine,
            destinations: std::sync::Arc::new(destinations),
            auth,
        };

        Ok(MergeOrchestrator {
            db,
            event_tx,
            config: std::sync::Arc::new(config),
            queue_state,
            stages,
        })
    }
}

impl MergeOrchestrator {
    /// Create an orchestrator with the default stage implementations
    pub async fn new(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Start building an orchestrator with injected stage implementations
    pub fn builder(config: Config) -> MergeOrchestratorBuilder {
        MergeOrchestratorBuilder {
            config,
            fetchers: Vec::new(),
            engine: None,
            destinations: Vec::new(),
            auth: None,
        }
    }

    /// Subscribe to task events
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. A subscriber that falls behind by more than the
    /// configured channel capacity receives a `RecvError::Lagged` error.
    /// Event delivery is best-effort and never affects task correctness.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::types::Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> std::sync::Arc<Config> {
        std::sync::Arc::clone(&self.config)
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// task execution never depends on anyone listening.
    pub(crate) fn emit_event(&self, event: crate::types::Event) {
        self.event_tx.send(event).ok();
    }
}
