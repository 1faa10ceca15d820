//! Mock stage implementations and a harness for orchestrator tests.

use crate::auth::AllowAll;
use crate::config::{Config, RetryConfig};
use crate::error::{DestinationError, MergeEngineError, SourceFetchError};
use crate::fetch::{FetchProgressFn, FetchedFile, SourceFetcher};
use crate::merge::{MergeEngine, MergeProgress, MergeProgressFn, MergedOutput};
use crate::publish::Destination;
use crate::types::{OwnerScope, Source, TaskId, TaskSnapshot};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::MergeOrchestrator;

pub(crate) const MOCK_FILE_SIZE: u64 = 10;

/// Configurable fake fetcher
///
/// Writes a small file per fetch so the merge stage has real paths to work
/// with. Cancellation is observed during the optional delay.
pub(crate) struct MockFetcher {
    pub(crate) delay: Duration,
    pub(crate) transient_failures: AtomicU32,
    pub(crate) permanent_fail: bool,
    pub(crate) block_until_cancel: bool,
    pub(crate) calls: AtomicU32,
    counter: AtomicU32,
}

impl MockFetcher {
    pub(crate) fn succeeding() -> Self {
        Self {
            delay: Duration::ZERO,
            transient_failures: AtomicU32::new(0),
            permanent_fail: false,
            block_until_cancel: false,
            calls: AtomicU32::new(0),
            counter: AtomicU32::new(0),
        }
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::succeeding()
        }
    }

    pub(crate) fn failing_transiently(times: u32) -> Self {
        Self {
            transient_failures: AtomicU32::new(times),
            ..Self::succeeding()
        }
    }

    pub(crate) fn failing_permanently() -> Self {
        Self {
            permanent_fail: true,
            ..Self::succeeding()
        }
    }

    pub(crate) fn blocking() -> Self {
        Self {
            block_until_cancel: true,
            ..Self::succeeding()
        }
    }
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    fn supports(&self, _source: &Source) -> bool {
        true
    }

    async fn fetch(
        &self,
        source: &Source,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &FetchProgressFn,
    ) -> Result<FetchedFile, SourceFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let cancelled = || SourceFetchError::RequestFailed {
            origin: source.label().to_string(),
            reason: "cancelled".to_string(),
            retryable: false,
        };

        if self.block_until_cancel {
            cancel.cancelled().await;
            return Err(cancelled());
        }

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        if self.permanent_fail {
            return Err(SourceFetchError::RequestFailed {
                origin: source.label().to_string(),
                reason: "server said no".to_string(),
                retryable: false,
            });
        }

        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(SourceFetchError::RequestFailed {
                origin: source.label().to_string(),
                reason: "connection reset".to_string(),
                retryable: true,
            });
        }

        progress(MOCK_FILE_SIZE, Some(MOCK_FILE_SIZE));

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = dest_dir.join(format!("input_{n}.bin"));
        tokio::fs::write(&path, b"0123456789")
            .await
            .map_err(|e| SourceFetchError::RequestFailed {
                origin: source.label().to_string(),
                reason: e.to_string(),
                retryable: false,
            })?;

        Ok(FetchedFile {
            path,
            size: MOCK_FILE_SIZE,
        })
    }
}

/// Configurable fake merge engine
pub(crate) struct MockEngine {
    pub(crate) fail: bool,
    pub(crate) block_until_cancel: bool,
    pub(crate) calls: AtomicU32,
}

impl MockEngine {
    pub(crate) fn succeeding() -> Self {
        Self {
            fail: false,
            block_until_cancel: false,
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::succeeding()
        }
    }

    pub(crate) fn blocking() -> Self {
        Self {
            block_until_cancel: true,
            ..Self::succeeding()
        }
    }
}

#[async_trait]
impl MergeEngine for MockEngine {
    async fn merge(
        &self,
        inputs: &[PathBuf],
        output_path: &Path,
        cancel: &CancellationToken,
        progress: &MergeProgressFn,
    ) -> Result<MergedOutput, MergeEngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.block_until_cancel {
            cancel.cancelled().await;
            return Err(MergeEngineError::EngineFailed {
                code: None,
                diagnostic: "cancelled".to_string(),
            });
        }

        if self.fail {
            return Err(MergeEngineError::EngineFailed {
                code: Some(1),
                diagnostic: "Invalid data found when processing input".to_string(),
            });
        }

        progress(MergeProgress {
            fraction: 1.0,
            elapsed_secs: 1,
            eta_secs: Some(0),
            output_bytes: Some(MOCK_FILE_SIZE * inputs.len() as u64),
        });

        let body = vec![b'm'; (MOCK_FILE_SIZE as usize) * inputs.len()];
        let size = body.len() as u64;
        tokio::fs::write(output_path, body)
            .await
            .map_err(|e| MergeEngineError::EngineFailed {
                code: None,
                diagnostic: e.to_string(),
            })?;

        Ok(MergedOutput {
            path: output_path.to_path_buf(),
            size,
        })
    }
}

/// Configurable fake destination
pub(crate) struct MockDestination {
    name: String,
    pub(crate) transient_failures: AtomicU32,
    pub(crate) hard_fail: bool,
    pub(crate) max_size: Option<u64>,
    pub(crate) complete_on_cancel: bool,
    pub(crate) calls: AtomicU32,
}

impl MockDestination {
    pub(crate) fn succeeding(name: &str) -> Self {
        Self {
            name: name.to_string(),
            transient_failures: AtomicU32::new(0),
            hard_fail: false,
            max_size: None,
            complete_on_cancel: false,
            calls: AtomicU32::new(0),
        }
    }

    /// Delivery that blocks until the token fires, then lands successfully,
    /// so the cancel and the delivery complete in the same instant
    pub(crate) fn completing_on_cancel(name: &str) -> Self {
        Self {
            complete_on_cancel: true,
            ..Self::succeeding(name)
        }
    }

    pub(crate) fn failing_transiently(name: &str, times: u32) -> Self {
        Self {
            transient_failures: AtomicU32::new(times),
            ..Self::succeeding(name)
        }
    }

    pub(crate) fn failing_hard(name: &str) -> Self {
        Self {
            hard_fail: true,
            ..Self::succeeding(name)
        }
    }

    pub(crate) fn with_size_cap(name: &str, max_size: u64) -> Self {
        Self {
            max_size: Some(max_size),
            ..Self::succeeding(name)
        }
    }
}

#[async_trait]
impl Destination for MockDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, size: u64) -> bool {
        self.max_size.is_none_or(|cap| size <= cap)
    }

    async fn deliver(
        &self,
        _artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, DestinationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.complete_on_cancel {
            cancel.cancelled().await;
            return Ok(format!("{}://delivery/{call}", self.name));
        }

        if self.hard_fail {
            return Err(DestinationError::Hard {
                destination: self.name.clone(),
                reason: "quota exceeded".to_string(),
            });
        }

        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(DestinationError::Transient {
                destination: self.name.clone(),
                reason: "503 service unavailable".to_string(),
            });
        }

        Ok(format!("{}://delivery/{call}", self.name))
    }
}

/// Config pointed at a temp directory, with retry delays fast enough for tests
pub(crate) fn test_config(dir: &tempfile::TempDir) -> Config {
    let fast_retry = |attempts| RetryConfig {
        max_attempts: attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    };

    Config {
        owner_scope: OwnerScope::new(1),
        storage: crate::config::StorageConfig {
            work_dir: dir.path().join("work"),
            database_path: dir.path().join("tasks.db"),
        },
        fetch_retry: fast_retry(3),
        publish_retry: fast_retry(2),
        ..Config::default()
    }
}

/// Build an orchestrator over mocks and start its queue processor
pub(crate) async fn spawn_orchestrator(
    config: Config,
    fetcher: Arc<dyn SourceFetcher>,
    engine: Arc<dyn MergeEngine>,
    destinations: Vec<Arc<dyn Destination>>,
) -> MergeOrchestrator {
    let mut builder = MergeOrchestrator::builder(config)
        .with_fetcher(fetcher)
        .with_merge_engine(engine)
        .with_auth_gate(Arc::new(AllowAll));
    for destination in destinations {
        builder = builder.with_destination(destination);
    }

    let orchestrator = builder.build().await.unwrap();
    orchestrator.start_queue_processor();
    orchestrator
}

/// The common happy-path harness: one fetcher, one engine, one destination
pub(crate) async fn happy_orchestrator(dir: &tempfile::TempDir) -> MergeOrchestrator {
    spawn_orchestrator(
        test_config(dir),
        Arc::new(MockFetcher::succeeding()),
        Arc::new(MockEngine::succeeding()),
        vec![Arc::new(MockDestination::succeeding("primary"))],
    )
    .await
}

pub(crate) fn direct_sources(count: usize) -> Vec<Source> {
    (0..count)
        .map(|i| Source::DirectUrl {
            url: format!("https://example.com/part{i}.mp4"),
        })
        .collect()
}

/// Poll task status until it reaches a terminal state
pub(crate) async fn wait_for_terminal(
    orchestrator: &MergeOrchestrator,
    id: TaskId,
) -> TaskSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = orchestrator.status(id).await.unwrap();
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} did not reach a terminal state in time (state: {:?})",
            snapshot.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the given task is registered in the active map
pub(crate) async fn wait_until_active(orchestrator: &MergeOrchestrator, id: TaskId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        {
            let active = orchestrator.queue_state.active_tasks.lock().await;
            if active.contains_key(&id) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} never became active"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
