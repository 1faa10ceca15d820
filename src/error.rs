//! Error types for mergebot-core
//!
//! The taxonomy follows the orchestrator's propagation policy:
//! - `Validation` / `Authorization` reject a submission before any task exists
//! - `SourceFetch` / `Resolve` are retried, then fatal to the task
//! - `MergeEngine` is fatal immediately (expensive transcodes are not re-run)
//! - `Destination` is retried per destination, fatal only if all destinations fail
//! - `NotFound` / `Forbidden` answer status/cancel calls on unknown or
//!   unauthorized tasks

use thiserror::Error;

/// Result type alias for mergebot-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mergebot-core
#[derive(Debug, Error)]
pub enum Error {
    /// Bad submission shape — rejected before any task exists
    #[error("validation error: {0}")]
    Validation(String),

    /// Scope not permitted — rejected before any task exists
    #[error("scope {0} is not authorized to submit tasks")]
    Authorization(crate::types::OwnerScope),

    /// Network or resolution failure while fetching a source
    #[error("source fetch error: {0}")]
    SourceFetch(#[from] SourceFetchError),

    /// External merge engine failure
    #[error("merge engine error: {0}")]
    MergeEngine(#[from] MergeEngineError),

    /// Per-destination delivery failure
    #[error("destination error: {0}")]
    Destination(#[from] DestinationError),

    /// Task not found
    #[error("task {0} not found")]
    NotFound(crate::types::TaskId),

    /// Requester may not control this task
    #[error("scope {requester} may not control task {id}")]
    Forbidden {
        /// The task the requester tried to control
        id: crate::types::TaskId,
        /// The scope that made the request
        requester: crate::types::OwnerScope,
    },

    /// Shutdown in progress - not accepting new tasks
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Source fetch errors — network, resolution, and verification failures
#[derive(Debug, Error)]
pub enum SourceFetchError {
    /// The URL failed basic validation before any request was made
    #[error("invalid source URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Hosting-link resolution failed (may be transient)
    #[error("failed to resolve hosting link '{url}': {reason}")]
    ResolveFailed {
        /// The hosting-service page URL
        url: String,
        /// Resolver diagnostic
        reason: String,
        /// Whether another attempt may succeed
        retryable: bool,
    },

    /// HTTP request failed while downloading
    ///
    /// The label field is not named `source`; thiserror reserves that name
    /// for the error-source chain.
    #[error("download of '{origin}' failed: {reason}")]
    RequestFailed {
        /// Label of the source being fetched
        origin: String,
        /// Underlying failure
        reason: String,
        /// Whether another attempt may succeed
        retryable: bool,
    },

    /// Downloaded byte count does not match the declared Content-Length
    #[error("size mismatch for '{origin}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Label of the source being fetched
        origin: String,
        /// Declared size
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// Source exceeds the configured maximum file size
    #[error("source '{origin}' is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge {
        /// Label of the source being fetched
        origin: String,
        /// Declared or observed size
        size: u64,
        /// Configured ceiling
        limit: u64,
    },

    /// No fetcher is registered for this source kind
    #[error("no fetcher available for source '{0}'")]
    Unsupported(String),
}

/// Merge engine errors — always fatal to the task, never retried
#[derive(Debug, Error)]
pub enum MergeEngineError {
    /// The engine binary could not be found or started
    #[error("failed to start merge engine: {0}")]
    SpawnFailed(String),

    /// The engine exited non-zero
    #[error("merge engine exited with {code:?}: {diagnostic}")]
    EngineFailed {
        /// Exit code, if the process was not killed by a signal
        code: Option<i32>,
        /// Tail of the engine's stderr output
        diagnostic: String,
    },

    /// The engine exited zero but produced no usable output
    #[error("merge engine produced no output at {path}")]
    MissingOutput {
        /// Expected output path
        path: std::path::PathBuf,
    },

    /// Pre-merge probing of an input failed
    #[error("failed to probe input '{path}': {reason}")]
    ProbeFailed {
        /// The input that could not be probed
        path: std::path::PathBuf,
        /// Probe diagnostic
        reason: String,
    },
}

/// Destination delivery errors
#[derive(Debug, Error)]
pub enum DestinationError {
    /// Transient delivery failure (rate limit, timeout) — retried
    #[error("delivery to '{destination}' failed: {reason}")]
    Transient {
        /// Destination name
        destination: String,
        /// Failure detail
        reason: String,
    },

    /// Hard delivery failure (auth failure, quota exceeded) — not retried
    #[error("delivery to '{destination}' rejected: {reason}")]
    Hard {
        /// Destination name
        destination: String,
        /// Failure detail
        reason: String,
    },
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}
