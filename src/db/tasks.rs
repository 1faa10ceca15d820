//! Task persistence: insert, state transitions, progress, history.

use crate::error::{DatabaseError, Error, Result};
use crate::types::{Artifacts, OwnerScope, TaskId, TaskSnapshot, TaskState};

use super::{Database, NewTask, TaskRow};

impl Database {
    /// Insert a new task in the Queued state, returning its assigned ID
    pub async fn insert_task(&self, new_task: &NewTask) -> Result<TaskId> {
        let inputs_json = serde_json::to_string(&new_task.inputs)?;
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (owner_scope, state, inputs, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(new_task.owner_scope)
        .bind(TaskState::Queued.to_i32())
        .bind(&inputs_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert task: {}",
                e
            )))
        })?;

        Ok(TaskId(result.last_insert_rowid()))
    }

    /// Get a task by ID
    pub async fn get_task(&self, id: TaskId) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get task: {}",
                    e
                )))
            })?;

        Ok(row)
    }

    /// Get a typed snapshot of a task, or NotFound
    pub async fn get_snapshot(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.require_task(id).await?.into_snapshot()
    }

    /// Record that the task left Queued and entered its first stage
    ///
    /// Sets `started_at` exactly once; later stage transitions go through
    /// [`set_state`](Self::set_state).
    pub async fn mark_started(&self, id: TaskId, state: TaskState) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "UPDATE tasks SET state = ?, started_at = COALESCE(started_at, ?) WHERE id = ?",
        )
        .bind(state.to_i32())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark task started: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Update the task's state
    pub async fn set_state(&self, id: TaskId, state: TaskState) -> Result<()> {
        sqlx::query("UPDATE tasks SET state = ? WHERE id = ?")
            .bind(state.to_i32())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update task state: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Move the task into a terminal state, recording the completion time
    /// and the fatal error message if any
    pub async fn mark_terminal(
        &self,
        id: TaskId,
        state: TaskState,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(state.is_terminal());
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "UPDATE tasks SET state = ?, error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(state.to_i32())
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark task terminal: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Update the task's stage progress
    pub async fn update_progress(&self, id: TaskId, fraction: f32, label: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET progress_fraction = ?, progress_label = ? WHERE id = ?")
            .bind(fraction)
            .bind(label)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update task progress: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Persist per-destination delivery outcomes
    pub async fn set_artifacts(&self, id: TaskId, artifacts: &Artifacts) -> Result<()> {
        let artifacts_json = serde_json::to_string(artifacts)?;

        sqlx::query("UPDATE tasks SET artifacts = ? WHERE id = ?")
            .bind(&artifacts_json)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update task artifacts: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Latch the cancel-requested flag
    ///
    /// The flag only ever goes from false to true; there is no un-cancel.
    pub async fn request_cancel(&self, id: TaskId) -> Result<()> {
        sqlx::query("UPDATE tasks SET cancel_requested = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set cancel flag: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Fail every task that was still active when the process last stopped
    ///
    /// Partially merged output is not resumable, so interrupted tasks are
    /// marked Failed at startup rather than silently re-queued. Returns the
    /// number of rows updated.
    pub async fn fail_interrupted_tasks(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?, error_message = ?, completed_at = ?
            WHERE state IN (?, ?, ?, ?)
            "#,
        )
        .bind(TaskState::Failed.to_i32())
        .bind("interrupted by process restart")
        .bind(now)
        .bind(TaskState::Queued.to_i32())
        .bind(TaskState::Fetching.to_i32())
        .bind(TaskState::Merging.to_i32())
        .bind(TaskState::Publishing.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to fail interrupted tasks: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Most recent tasks for a scope, newest first
    pub async fn tasks_for_scope(
        &self,
        owner_scope: OwnerScope,
        limit: u32,
    ) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE owner_scope = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(owner_scope)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list tasks for scope: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Count tasks currently in a non-terminal state
    pub async fn count_active_tasks(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE state IN (?, ?, ?, ?)")
                .bind(TaskState::Queued.to_i32())
                .bind(TaskState::Fetching.to_i32())
                .bind(TaskState::Merging.to_i32())
                .bind(TaskState::Publishing.to_i32())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to count active tasks: {}",
                        e
                    )))
                })?;

        Ok(count)
    }
}
