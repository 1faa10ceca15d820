//! Queue processor — pops accepted tasks in FIFO order and spawns workers.

use std::sync::Arc;
use std::time::Duration;

use super::MergeOrchestrator;
use super::task_worker::{self, TaskContext};

/// Interval between queue polling attempts when the queue is empty
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl MergeOrchestrator {
    /// Start the queue processor task
    ///
    /// Spawns a background task that continuously:
    /// 1. Pops the oldest queued task (FIFO)
    /// 2. Acquires a permit from the concurrency limiter
    ///    (respects max_concurrent_tasks)
    /// 3. Spawns a worker for that task
    /// 4. Repeats until shutdown
    ///
    /// Excess submissions wait in the queue without consuming a worker slot,
    /// so a burst of N tasks never runs more than the configured ceiling at
    /// once.
    pub fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue_state.queue.clone();
        let concurrent_limit = self.queue_state.concurrent_limit.clone();
        let active_tasks = self.queue_state.active_tasks.clone();
        let db = self.db.clone();
        let event_tx = self.event_tx.clone();
        let config = self.config.clone();
        let stages = self.stages.clone();

        tokio::spawn(async move {
            loop {
                // Pop the next task (keep the full item for re-push on failure)
                let queued_item = {
                    let mut queue_guard = queue.lock().await;
                    queue_guard.pop_front()
                };

                if let Some(item) = queued_item {
                    let id = item.id;

                    // Blocks while the worker pool is saturated
                    let permit = match concurrent_limit.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => {
                            // Semaphore closed — re-push the item so it isn't lost
                            let mut queue_guard = queue.lock().await;
                            queue_guard.push_front(item);
                            break;
                        }
                    };

                    let cancel_token = tokio_util::sync::CancellationToken::new();

                    {
                        let mut active = active_tasks.lock().await;
                        active.insert(id, cancel_token.clone());
                    }

                    let ctx = TaskContext {
                        id,
                        owner_scope: item.owner_scope,
                        inputs: item.inputs,
                        db: Arc::clone(&db),
                        event_tx: event_tx.clone(),
                        config: Arc::clone(&config),
                        stages: stages.clone(),
                        active_tasks: Arc::clone(&active_tasks),
                        cancel_token,
                    };

                    tokio::spawn(async move {
                        let _permit = permit;
                        task_worker::run_task(ctx).await;
                    });
                } else {
                    // Queue is empty, wait a bit before checking again
                    tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                }
            }
        })
    }
}
