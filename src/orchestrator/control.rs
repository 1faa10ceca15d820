//! Task lifecycle control — cancel, status, history, scope management,
//! shutdown.

use crate::error::{Error, Result};
use crate::types::{Event, OwnerScope, TaskId, TaskSnapshot, TaskState};

use super::MergeOrchestrator;

impl MergeOrchestrator {
    /// Request cancellation of a task
    ///
    /// Only the task's owner scope or the system-owner scope may cancel.
    /// Cancellation is cooperative: a queued task is cancelled immediately,
    /// an active task stops at its next observation point (chunk boundary,
    /// stage boundary, or engine kill). Cancelling a task that is already
    /// terminal is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the task doesn't exist
    /// - [`Error::Forbidden`] if the requester may not control this task
    pub async fn cancel(&self, id: TaskId, requester: OwnerScope) -> Result<()> {
        let task = self.db.require_task(id).await?;

        if task.owner_scope != requester.0 && requester != self.config.owner_scope {
            return Err(Error::Forbidden { id, requester });
        }

        let state = TaskState::from_i32(task.state);
        if state.is_terminal() {
            // The cancel/completion race resolves in favor of whichever
            // terminal state landed first
            return Ok(());
        }

        // Latch the flag first so a worker that pops the task between our
        // queue check and its first cancel check still sees it
        self.db.request_cancel(id).await?;

        // Signal the running worker, if any
        {
            let active = self.queue_state.active_tasks.lock().await;
            if let Some(token) = active.get(&id) {
                tracing::info!(task_id = id.0, "Signalling cancellation to active task");
                token.cancel();
                return Ok(());
            }
        }

        // Not active: if it is still waiting in the queue, finish it here
        let removed = {
            let mut queue = self.queue_state.queue.lock().await;
            let before = queue.len();
            queue.retain(|t| t.id != id);
            queue.len() != before
        };

        if removed {
            self.db.mark_terminal(id, TaskState::Cancelled, None).await?;
            self.emit_event(Event::Cancelled {
                id,
                owner_scope: OwnerScope(task.owner_scope),
            });
            tracing::info!(task_id = id.0, "Cancelled queued task");
        }
        // Otherwise the worker has already popped it; the latched flag is
        // observed at its first check

        Ok(())
    }

    /// Get a consistent snapshot of a task
    ///
    /// Reads go through the database, so a snapshot taken after a state
    /// transition is always at least as new as that transition.
    pub async fn status(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.db.get_snapshot(id).await
    }

    /// Most recent tasks submitted by a scope, newest first
    pub async fn history(&self, scope: OwnerScope, limit: u32) -> Result<Vec<TaskSnapshot>> {
        let rows = self.db.tasks_for_scope(scope, limit).await?;
        rows.into_iter().map(|row| row.into_snapshot()).collect()
    }

    /// Add a scope to the submission allow-list (system owner only)
    pub async fn authorize_scope(&self, requester: OwnerScope, scope: OwnerScope) -> Result<()> {
        self.require_owner(requester)?;
        self.db.add_authorized_scope(scope).await?;
        tracing::info!(scope = scope.0, "Scope authorized");
        Ok(())
    }

    /// Remove a scope from the allow-list (system owner only)
    ///
    /// Returns true if the scope was present.
    pub async fn deauthorize_scope(
        &self,
        requester: OwnerScope,
        scope: OwnerScope,
    ) -> Result<bool> {
        self.require_owner(requester)?;
        let removed = self.db.remove_authorized_scope(scope).await?;
        if removed {
            tracing::info!(scope = scope.0, "Scope deauthorized");
        }
        Ok(removed)
    }

    /// List all scopes on the allow-list (system owner only)
    pub async fn list_authorized_scopes(&self, requester: OwnerScope) -> Result<Vec<OwnerScope>> {
        self.require_owner(requester)?;
        self.db.list_authorized_scopes().await
    }

    fn require_owner(&self, requester: OwnerScope) -> Result<()> {
        if requester != self.config.owner_scope {
            return Err(Error::Authorization(requester));
        }
        Ok(())
    }

    /// Gracefully shut down the orchestrator
    ///
    /// 1. Stops accepting new submissions
    /// 2. Signals cancellation to every active task (merges are not
    ///    resumable, so there is nothing to be gained by waiting them out)
    /// 3. Waits for active workers to finish their terminal bookkeeping,
    ///    with a timeout
    /// 4. Emits [`Event::Shutdown`]
    ///
    /// Tasks still in the queue stay Queued in the database and are failed
    /// on the next startup.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.queue_state
            .accepting_new
            .store(false, std::sync::atomic::Ordering::SeqCst);
        tracing::info!("Stopped accepting new submissions");

        {
            let active = self.queue_state.active_tasks.lock().await;
            tracing::info!(active_count = active.len(), "Cancelling active tasks");
            for (id, token) in active.iter() {
                tracing::debug!(task_id = id.0, "Signalling cancellation");
                token.cancel();
            }
        }

        let shutdown_timeout = std::time::Duration::from_secs(30);
        let wait_result =
            tokio::time::timeout(shutdown_timeout, self.wait_for_active_tasks()).await;

        match wait_result {
            Ok(()) => tracing::info!("All active tasks finished"),
            Err(_) => tracing::warn!("Timeout waiting for active tasks, proceeding with shutdown"),
        }

        self.emit_event(Event::Shutdown);

        // Database connections close when the last Arc reference drops
        tracing::info!("Database connections will close on drop");

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Wait for the active-task registry to drain
    async fn wait_for_active_tasks(&self) {
        loop {
            let active_count = {
                let active = self.queue_state.active_tasks.lock().await;
                active.len()
            };

            if active_count == 0 {
                return;
            }

            tracing::debug!(active_count, "Waiting for active tasks to finish");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}
