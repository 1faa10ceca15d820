//! Core types for mergebot-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a merge task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for i64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for TaskId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Identifier of the submitting chat or user
///
/// Used for the authorization check at submission time and for routing
/// progress/result events back to the submitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerScope(pub i64);

impl OwnerScope {
    /// Create a new OwnerScope
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for OwnerScope {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<sqlx::Sqlite> for OwnerScope {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for OwnerScope {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for OwnerScope {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Task lifecycle state
///
/// Valid transitions:
/// ```text
/// Queued -> Fetching -> Merging -> Publishing -> Succeeded
/// Queued -> Cancelled
/// Fetching/Merging/Publishing -> Cancelled | Failed
/// ```
/// `Succeeded`, `Failed`, and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in the FIFO queue
    Queued,
    /// Downloading input sources
    Fetching,
    /// Running the external merge engine
    Merging,
    /// Delivering the merged artifact to destinations
    Publishing,
    /// At least one destination delivery succeeded
    Succeeded,
    /// A stage failed fatally
    Failed,
    /// Cancel request observed at a stage boundary
    Cancelled,
}

impl TaskState {
    /// Convert integer state code to TaskState enum
    pub fn from_i32(state: i32) -> Self {
        match state {
            0 => TaskState::Queued,
            1 => TaskState::Fetching,
            2 => TaskState::Merging,
            3 => TaskState::Publishing,
            4 => TaskState::Succeeded,
            5 => TaskState::Failed,
            6 => TaskState::Cancelled,
            _ => TaskState::Failed, // Unknown codes surface as Failed, never as active
        }
    }

    /// Convert TaskState enum to integer state code
    pub fn to_i32(&self) -> i32 {
        match self {
            TaskState::Queued => 0,
            TaskState::Fetching => 1,
            TaskState::Merging => 2,
            TaskState::Publishing => 3,
            TaskState::Succeeded => 4,
            TaskState::Failed => 5,
            TaskState::Cancelled => 6,
        }
    }

    /// Whether this state has no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// One input to merge
///
/// Immutable once attached to a task. Merge order is the order sources were
/// submitted in, never fetch-completion order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// Direct HTTP(S) download link
    DirectUrl {
        /// The URL to fetch
        url: String,
    },
    /// Third-party hosting link that must be resolved to a direct URL first
    HostedLink {
        /// The hosting-service page URL
        url: String,
        /// Optional password for protected links
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Opaque reference to a previously-uploaded file, fetched by the embedder
    FileRef {
        /// Platform-specific file identifier
        reference: String,
    },
}

impl Source {
    /// Short human-readable label used in progress and error messages
    pub fn label(&self) -> &str {
        match self {
            Source::DirectUrl { url } | Source::HostedLink { url, .. } => url,
            Source::FileRef { reference } => reference,
        }
    }
}

/// Stage fraction plus a human-readable phase label
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Progress {
    /// Fractional completion of the current stage (0.0 to 1.0)
    pub fraction: f32,
    /// Phase label, e.g. "fetching 2/3" or "merging"
    pub label: String,
}

/// Delivery outcome for a single destination
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Delivered successfully
    Delivered {
        /// Destination-specific reference (message id, download link, ...)
        reference: String,
    },
    /// Delivery failed after exhausting retries
    Failed {
        /// Why delivery failed
        reason: String,
    },
}

/// Per-destination delivery results, keyed by destination name
///
/// Entries are only ever added, never removed.
pub type Artifacts = BTreeMap<String, DeliveryOutcome>;

/// Consistent point-in-time view of a task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Unique task identifier
    pub id: TaskId,

    /// Submitting chat/user scope
    pub owner_scope: OwnerScope,

    /// Current lifecycle state
    pub state: TaskState,

    /// Current stage progress
    pub progress: Progress,

    /// Ordered merge inputs
    pub inputs: Vec<Source>,

    /// Per-destination delivery results (populated during Publishing)
    pub artifacts: Artifacts,

    /// Last fatal error (set only on transition to Failed)
    pub error: Option<String>,

    /// Whether cancellation has been requested
    pub cancel_requested: bool,

    /// When the task was submitted
    pub created_at: DateTime<Utc>,

    /// When the task left Queued (None if still queued)
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

/// Event emitted during the task lifecycle
///
/// Consumed by the transport layer for rendering progress/result messages.
/// Delivery is best-effort; dropped events never affect task correctness.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task accepted and queued
    Queued {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// Number of inputs to merge
        input_count: usize,
    },

    /// A stage worker started a new stage
    StageStarted {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// The stage being entered
        state: TaskState,
    },

    /// Incremental fetch progress aggregated across all sources
    ///
    /// Size-weighted when every source declared a total, count-weighted
    /// otherwise.
    FetchProgress {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// Overall fetch fraction (0.0 to 1.0)
        fraction: f32,
        /// Bytes downloaded across all sources
        downloaded_bytes: u64,
    },

    /// Incremental merge-engine progress
    MergeProgress {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// Merge fraction (0.0 to 1.0)
        fraction: f32,
        /// Seconds of output produced so far
        elapsed_secs: u64,
        /// Estimated seconds remaining (None early in the run)
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_secs: Option<u64>,
        /// Current output size in bytes (if reported by the engine)
        #[serde(skip_serializing_if = "Option::is_none")]
        output_bytes: Option<u64>,
    },

    /// A destination delivery is starting
    PublishProgress {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// Destination about to be attempted
        destination: String,
        /// Destinations already resolved (delivered or failed)
        completed: usize,
        /// Total registered destinations
        total: usize,
    },

    /// A destination delivery succeeded
    Delivered {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// Destination name
        destination: String,
        /// Destination-specific reference
        reference: String,
    },

    /// A destination delivery failed after exhausting retries
    DeliveryFailed {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// Destination name
        destination: String,
        /// Failure reason
        error: String,
    },

    /// Task reached Succeeded
    Succeeded {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// Per-destination outcomes
        artifacts: Artifacts,
    },

    /// Task reached Failed
    Failed {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
        /// Stage where the failure occurred
        stage: TaskState,
        /// Error message
        error: String,
    },

    /// Task reached Cancelled
    Cancelled {
        /// Task ID
        id: TaskId,
        /// Submitter scope
        owner_scope: OwnerScope,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn task_state_round_trips_through_i32_for_all_variants() {
        let cases = [
            (TaskState::Queued, 0),
            (TaskState::Fetching, 1),
            (TaskState::Merging, 2),
            (TaskState::Publishing, 3),
            (TaskState::Succeeded, 4),
            (TaskState::Failed, 5),
            (TaskState::Cancelled, 6),
        ];

        for (variant, expected_int) in cases {
            assert_eq!(
                variant.to_i32(),
                expected_int,
                "{variant:?} should encode to {expected_int}"
            );
            assert_eq!(
                TaskState::from_i32(expected_int),
                variant,
                "{expected_int} should decode to {variant:?}"
            );
        }
    }

    #[test]
    fn task_state_from_unknown_integer_defaults_to_failed() {
        assert_eq!(
            TaskState::from_i32(99),
            TaskState::Failed,
            "unknown state 99 must fall back to Failed so corrupted DB rows surface visibly"
        );
        assert_eq!(
            TaskState::from_i32(-1),
            TaskState::Failed,
            "negative state must fall back to Failed, not silently become Queued"
        );
    }

    #[test]
    fn terminal_states_are_exactly_succeeded_failed_cancelled() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Fetching.is_terminal());
        assert!(!TaskState::Merging.is_terminal());
        assert!(!TaskState::Publishing.is_terminal());
    }

    #[test]
    fn task_id_from_str_parses_valid_integer() {
        let id = TaskId::from_str("123").unwrap();
        assert_eq!(id.get(), 123);
    }

    #[test]
    fn task_id_from_str_rejects_non_numeric() {
        assert!(TaskId::from_str("abc").is_err());
        assert!(TaskId::from_str("").is_err());
        assert!(TaskId::from_str("3.14").is_err());
    }

    #[test]
    fn task_id_display_matches_inner_value() {
        assert_eq!(TaskId::new(999).to_string(), "999");
        assert_eq!(TaskId::new(-42).to_string(), "-42");
    }

    #[test]
    fn source_serializes_with_kind_tag() {
        let src = Source::HostedLink {
            url: "https://gofile.io/d/abc".to_string(),
            password: None,
        };
        let json = serde_json::to_string(&src).unwrap();
        assert!(json.contains("\"kind\":\"hosted_link\""), "got: {json}");
        assert!(
            !json.contains("password"),
            "absent password must be skipped: {json}"
        );

        let back: Source = serde_json::from_str(&json).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn source_label_points_at_the_url_or_reference() {
        let direct = Source::DirectUrl {
            url: "https://example.com/a.mp4".to_string(),
        };
        assert_eq!(direct.label(), "https://example.com/a.mp4");

        let file_ref = Source::FileRef {
            reference: "file-777".to_string(),
        };
        assert_eq!(file_ref.label(), "file-777");
    }

    #[test]
    fn delivery_outcome_round_trips_through_json() {
        let mut artifacts = Artifacts::new();
        artifacts.insert(
            "gofile".to_string(),
            DeliveryOutcome::Delivered {
                reference: "https://gofile.io/d/xyz".to_string(),
            },
        );
        artifacts.insert(
            "chat".to_string(),
            DeliveryOutcome::Failed {
                reason: "quota exceeded".to_string(),
            },
        );

        let json = serde_json::to_string(&artifacts).unwrap();
        let back: Artifacts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, artifacts);
    }
}
