//! Database layer for mergebot-core
//!
//! Handles SQLite persistence for tasks and the authorization allow-list.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`tasks`] — Task CRUD, state/progress/artifact updates, history lookup
//! - [`auth`] — Authorized-scope allow-list

use crate::error::{Error, Result};
use crate::types::{
    Artifacts, OwnerScope, Progress, Source, TaskId, TaskSnapshot, TaskState,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod auth;
mod migrations;
mod tasks;


/// New task to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Submitting chat/user scope
    pub owner_scope: OwnerScope,
    /// Ordered merge inputs, serialized to JSON on insert
    pub inputs: Vec<Source>,
}

/// Task record from database
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    /// Unique database ID
    pub id: i64,
    /// Submitting chat/user scope
    pub owner_scope: i64,
    /// Current state (see TaskState::to_i32)
    pub state: i32,
    /// Current stage fraction (0.0-1.0)
    pub progress_fraction: f32,
    /// Current phase label
    pub progress_label: String,
    /// Ordered inputs as JSON
    pub inputs: String,
    /// Per-destination outcomes as JSON
    pub artifacts: String,
    /// Error message if the task failed
    pub error_message: Option<String>,
    /// Whether cancellation has been requested
    pub cancel_requested: bool,
    /// Unix timestamp when the task was submitted
    pub created_at: i64,
    /// Unix timestamp when the task left Queued
    pub started_at: Option<i64>,
    /// Unix timestamp when the task reached a terminal state
    pub completed_at: Option<i64>,
}

impl TaskRow {
    /// Convert the raw row into a typed snapshot
    pub fn into_snapshot(self) -> Result<TaskSnapshot> {
        let inputs: Vec<Source> = serde_json::from_str(&self.inputs)?;
        let artifacts: Artifacts = serde_json::from_str(&self.artifacts)?;

        Ok(TaskSnapshot {
            id: TaskId(self.id),
            owner_scope: OwnerScope(self.owner_scope),
            state: TaskState::from_i32(self.state),
            progress: Progress {
                fraction: self.progress_fraction,
                label: self.progress_label,
            },
            inputs,
            artifacts,
            error: self.error_message,
            cancel_requested: self.cancel_requested,
            created_at: timestamp_to_datetime(self.created_at),
            started_at: self.started_at.map(timestamp_to_datetime),
            completed_at: self.completed_at.map(timestamp_to_datetime),
        })
    }
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

/// Database instance wrapping the SQLite connection pool
#[derive(Debug, Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Fetch a task row or return a typed NotFound error
    pub(crate) async fn require_task(&self, id: TaskId) -> Result<TaskRow> {
        self.get_task(id).await?.ok_or(Error::NotFound(id))
    }
}
