//! # mergebot-core
//!
//! Backend library for multi-source video merge bot applications.
//!
//! A task takes an ordered list of video sources, downloads them, joins them
//! with an external merge engine (ffmpeg by default), and delivers the result
//! to one or more destinations. The orchestrator runs tasks through a FIFO
//! queue with a bounded worker pool and reports progress through a broadcast
//! event stream.
//!
//! ## Design Philosophy
//!
//! mergebot-core is designed to be:
//! - **Library-first** - No chat transport or UI, purely a Rust crate for embedding
//! - **Injectable** - Fetchers, the merge engine, destinations, and the
//!   authorization gate are all trait objects supplied at construction time
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Crash-honest** - Interrupted tasks are failed visibly on restart,
//!   never silently re-queued
//!
//! ## Quick Start
//!
//! ```no_run
//! use mergebot_core::{Config, MergeOrchestrator, OwnerScope, Source};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         owner_scope: OwnerScope::new(123456),
//!         ..Default::default()
//!     };
//!
//!     let orchestrator = MergeOrchestrator::new(config).await?;
//!     orchestrator.start_queue_processor();
//!
//!     // Subscribe to events
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let id = orchestrator
//!         .submit(
//!             OwnerScope::new(123456),
//!             vec![
//!                 Source::DirectUrl { url: "https://example.com/part1.mp4".into() },
//!                 Source::DirectUrl { url: "https://example.com/part2.mp4".into() },
//!             ],
//!         )
//!         .await?;
//!     println!("Submitted task {id}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Submission authorization gate
pub mod auth;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Source fetching (URL validation, link resolution, downloads)
pub mod fetch;
/// External merge engine
pub mod merge;
/// Core orchestrator implementation (decomposed into focused submodules)
pub mod orchestrator;
/// Artifact delivery destinations
pub mod publish;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use auth::{AllowAll, AuthorizationGate, DbAuthGate};
pub use config::{
    Config, LimitsConfig, MergeConfig, RetryConfig, StageTimeouts, StorageConfig,
};
pub use db::Database;
pub use error::{
    DatabaseError, DestinationError, Error, MergeEngineError, Result, SourceFetchError,
};
pub use fetch::{FetchedFile, GofileResolver, HttpSourceFetcher, LinkResolver, SourceFetcher};
pub use merge::{FfmpegMergeEngine, MergeEngine, MergedOutput};
pub use orchestrator::{MergeOrchestrator, MergeOrchestratorBuilder};
pub use publish::{Destination, GofileDestination};
pub use retry::{IsRetryable, retry_with_backoff};
pub use types::{
    Artifacts, DeliveryOutcome, Event, OwnerScope, Progress, Source, TaskId, TaskSnapshot,
    TaskState,
};

/// Helper function to run the orchestrator with graceful signal handling.
///
/// Waits for a termination signal and then calls the orchestrator's
/// `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use mergebot_core::{Config, MergeOrchestrator, OwnerScope, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config { owner_scope: OwnerScope::new(1), ..Default::default() };
///     let orchestrator = MergeOrchestrator::new(config).await?;
///     orchestrator.start_queue_processor();
///
///     // Run with automatic signal handling
///     run_with_shutdown(orchestrator).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(orchestrator: MergeOrchestrator) -> Result<()> {
    wait_for_signal().await;
    orchestrator.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
