//! Configuration types for mergebot-core

use crate::types::OwnerScope;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage configuration (working directories, persistence path)
///
/// Groups settings related to where fetched inputs, merged outputs, and the
/// task database live. Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Working directory for per-task temp storage (default: "./work")
    ///
    /// Each task owns `<work_dir>/task_<id>/` exclusively; the directory is
    /// deleted unconditionally on every exit path.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// SQLite database path (default: "./mergebot.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            database_path: default_database_path(),
        }
    }
}

/// Concurrency and resource ceilings
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum tasks in an active (non-Queued) state at once (default: 5)
    ///
    /// This is the system resource ceiling `C`; excess submissions wait in a
    /// FIFO queue.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Maximum concurrent source fetches within a single task (default: 3)
    ///
    /// Bounds connections per job, distinct from the task-level ceiling.
    #[serde(default = "default_fetch_fanout")]
    pub fetch_fanout: usize,

    /// Maximum size of a single source file in bytes (default: 2 GiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Maximum accepted URL length (default: 2048)
    #[serde(default = "default_max_url_length")]
    pub max_url_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            fetch_fanout: default_fetch_fanout(),
            max_file_size: default_max_file_size(),
            max_url_length: default_max_url_length(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial try (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 5 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Merge engine configuration (external ffmpeg/ffprobe binaries)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Path to ffmpeg executable (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Path to ffprobe executable (auto-detected if None)
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,

    /// Whether to search PATH for binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Output container extension (default: "mkv")
    #[serde(default = "default_output_container")]
    pub output_container: String,

    /// Prefix for generated output filenames (default: "merged")
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            search_path: true,
            output_container: default_output_container(),
            output_prefix: default_output_prefix(),
        }
    }
}

/// Per-stage timeouts, each treated identically to a cancellation request
///
/// `None` disables the timeout for that stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Fetching stage timeout
    #[serde(default, with = "opt_duration_serde")]
    pub fetch: Option<Duration>,

    /// Merging stage timeout
    #[serde(default, with = "opt_duration_serde")]
    pub merge: Option<Duration>,

    /// Publishing stage timeout
    #[serde(default, with = "opt_duration_serde")]
    pub publish: Option<Duration>,
}

/// Main configuration for the orchestrator
///
/// Fields are organized into logical sub-configs:
/// - [`storage`](StorageConfig) — working directories and database path
/// - [`limits`](LimitsConfig) — concurrency ceilings and size caps
/// - [`merge`](MergeConfig) — external merge engine binaries
/// - [`timeouts`](StageTimeouts) — per-stage timeouts
///
/// Sub-config fields are flattened for a flat JSON/TOML format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// System-owner scope: may cancel any task and manage the allow-list
    pub owner_scope: OwnerScope,

    /// Working directories and database path
    #[serde(flatten)]
    pub storage: StorageConfig,

    /// Concurrency ceilings and size caps
    #[serde(flatten)]
    pub limits: LimitsConfig,

    /// External merge engine binaries
    #[serde(flatten)]
    pub merge: MergeConfig,

    /// Per-stage timeouts
    #[serde(flatten)]
    pub timeouts: StageTimeouts,

    /// Retry policy for source fetches and link resolution
    #[serde(default = "RetryConfig::default")]
    pub fetch_retry: RetryConfig,

    /// Retry policy for destination deliveries
    #[serde(default = "default_publish_retry")]
    pub publish_retry: RetryConfig,

    /// Event broadcast channel capacity (default: 1000)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner_scope: OwnerScope::new(0),
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            merge: MergeConfig::default(),
            timeouts: StageTimeouts::default(),
            fetch_retry: RetryConfig::default(),
            publish_retry: default_publish_retry(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./work")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./mergebot.db")
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_fetch_fanout() -> usize {
    3
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_max_url_length() -> usize {
    2048
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_output_container() -> String {
    "mkv".to_string()
}

fn default_output_prefix() -> String {
    "merged".to_string()
}

fn default_publish_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

fn default_event_capacity() -> usize {
    1000
}

/// Serialize Duration as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serialize Option<Duration> as whole seconds
mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.limits.max_concurrent_tasks, 5);
        assert_eq!(config.limits.fetch_fanout, 3);
        assert_eq!(config.limits.max_file_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.merge.output_container, "mkv");
        assert_eq!(config.fetch_retry.max_attempts, 5);
        assert_eq!(config.publish_retry.max_attempts, 3);
        assert!(config.timeouts.merge.is_none());
    }

    #[test]
    fn config_deserializes_from_empty_object_except_owner() {
        let config: Config = serde_json::from_str(r#"{"owner_scope": 123}"#).unwrap();
        assert_eq!(config.owner_scope.get(), 123);
        assert_eq!(config.limits.max_concurrent_tasks, 5);
        assert_eq!(config.storage.work_dir, PathBuf::from("./work"));
    }

    #[test]
    fn durations_round_trip_as_seconds() {
        let config = Config {
            owner_scope: OwnerScope::new(1),
            timeouts: StageTimeouts {
                merge: Some(Duration::from_secs(600)),
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeouts.merge, Some(Duration::from_secs(600)));
        assert_eq!(back.fetch_retry.initial_delay, Duration::from_secs(5));
    }
}
