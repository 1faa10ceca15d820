//! Task submission: validation, authorization, persistence, enqueue.

use crate::db::NewTask;
use crate::error::{Error, Result};
use crate::types::{Event, OwnerScope, Source, TaskId};

use super::{MergeOrchestrator, QueuedTask};

/// Merging needs at least this many inputs to be meaningful
const MIN_SOURCES: usize = 2;

impl MergeOrchestrator {
    /// Submit a new merge task
    ///
    /// Validates the submission shape, checks the authorization gate, assigns
    /// a task ID, persists the task in the Queued state, and enqueues it for
    /// processing. Returns the assigned ID immediately; all further progress
    /// is reported through events and [`status`](Self::status).
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once shutdown has begun
    /// - [`Error::Validation`] for an empty, too-small, or malformed source list
    /// - [`Error::Authorization`] when the scope is not allowed to submit
    pub async fn submit(&self, owner_scope: OwnerScope, inputs: Vec<Source>) -> Result<TaskId> {
        if !self
            .queue_state
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::ShuttingDown);
        }

        self.validate_inputs(&inputs)?;

        if !self.stages.auth.is_authorized(owner_scope).await? {
            tracing::warn!(scope = owner_scope.0, "Rejected submission from unauthorized scope");
            return Err(Error::Authorization(owner_scope));
        }

        let id = self
            .db
            .insert_task(&NewTask {
                owner_scope,
                inputs: inputs.clone(),
            })
            .await?;

        tracing::info!(
            task_id = id.0,
            scope = owner_scope.0,
            input_count = inputs.len(),
            "Task accepted"
        );

        {
            let mut queue = self.queue_state.queue.lock().await;
            queue.push_back(QueuedTask {
                id,
                owner_scope,
                inputs: inputs.clone(),
            });
        }

        self.emit_event(Event::Queued {
            id,
            owner_scope,
            input_count: inputs.len(),
        });

        Ok(id)
    }

    /// Validate the submission shape before any task exists
    ///
    /// URL-bearing sources are checked up front so obviously broken
    /// submissions are rejected synchronously instead of failing later in
    /// the Fetching stage.
    fn validate_inputs(&self, inputs: &[Source]) -> Result<()> {
        if inputs.len() < MIN_SOURCES {
            return Err(Error::Validation(format!(
                "at least {MIN_SOURCES} sources are required to merge, got {}",
                inputs.len()
            )));
        }

        for source in inputs {
            match source {
                Source::DirectUrl { url } | Source::HostedLink { url, .. } => {
                    crate::fetch::validate_url(url, self.config.limits.max_url_length)
                        .map_err(|e| Error::Validation(e.to_string()))?;
                }
                Source::FileRef { reference } => {
                    if reference.is_empty() {
                        return Err(Error::Validation(
                            "file reference must not be empty".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
