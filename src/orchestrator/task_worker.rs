//! Core task execution: runs one task through Fetching, Merging, and
//! Publishing, persisting every transition and emitting progress events.
//!
//! Cancellation (and a stage timeout, which is treated identically) is
//! observed at chunk boundaries inside the fetchers, by killing the engine
//! during a merge, and between destinations during publishing. Cleanup of
//! the task's working directory runs on every exit path.

use crate::config::Config;
use crate::db::Database;
use crate::error::Error;
use crate::fetch::FetchedFile;
use crate::merge::{MergeProgress, MergedOutput};
use crate::retry::retry_with_backoff;
use crate::types::{
    Artifacts, DeliveryOutcome, Event, OwnerScope, Source, TaskId, TaskState,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::StageSet;

/// How often merge progress is flushed to the database
const MERGE_PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Everything a worker needs to run one task
pub(crate) struct TaskContext {
    pub(crate) id: TaskId,
    pub(crate) owner_scope: OwnerScope,
    pub(crate) inputs: Vec<Source>,
    pub(crate) db: Arc<Database>,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    pub(crate) config: Arc<Config>,
    pub(crate) stages: StageSet,
    pub(crate) active_tasks: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    pub(crate) cancel_token: CancellationToken,
}

impl TaskContext {
    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

/// How the task ended
enum TaskOutcome {
    Succeeded(Artifacts),
    Cancelled,
    Failed { stage: TaskState, error: String },
}

/// Run one task end to end
pub(crate) async fn run_task(ctx: TaskContext) {
    // A cancel that raced the queue pop latched the flag; honor it before
    // doing any work
    let pre_cancelled = match ctx.db.get_task(ctx.id).await {
        Ok(Some(row)) => row.cancel_requested,
        Ok(None) => {
            tracing::error!(task_id = ctx.id.0, "Task disappeared before execution");
            remove_from_active(&ctx).await;
            return;
        }
        Err(e) => {
            tracing::error!(task_id = ctx.id.0, error = %e, "Failed to load task");
            finalize(
                &ctx,
                TaskOutcome::Failed {
                    stage: TaskState::Queued,
                    error: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    if pre_cancelled || ctx.cancel_token.is_cancelled() {
        finalize(&ctx, TaskOutcome::Cancelled).await;
        return;
    }

    let work_dir = ctx
        .config
        .storage
        .work_dir
        .join(format!("task_{}", ctx.id.0));

    if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
        finalize(
            &ctx,
            TaskOutcome::Failed {
                stage: TaskState::Fetching,
                error: format!("failed to create working directory: {e}"),
            },
        )
        .await;
        return;
    }

    let outcome = run_stages(&ctx, &work_dir).await;

    // The working directory is removed on every exit path, success included
    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        tracing::warn!(
            task_id = ctx.id.0,
            work_dir = %work_dir.display(),
            error = %e,
            "Failed to remove working directory"
        );
    }

    finalize(&ctx, outcome).await;
}

async fn run_stages(ctx: &TaskContext, work_dir: &Path) -> TaskOutcome {
    // --- Fetching ---
    if let Err(e) = ctx.db.mark_started(ctx.id, TaskState::Fetching).await {
        return db_failure(TaskState::Fetching, e);
    }
    ctx.emit(Event::StageStarted {
        id: ctx.id,
        owner_scope: ctx.owner_scope,
        state: TaskState::Fetching,
    });

    let fetched = match run_with_timeout(
        ctx.config.timeouts.fetch,
        &ctx.cancel_token,
        fetch_stage(ctx, work_dir),
    )
    .await
    {
        StageResult::Completed(Ok(files)) => files,
        StageResult::Completed(Err(e)) => return classify(ctx, TaskState::Fetching, e),
        StageResult::TimedOut => {
            tracing::info!(task_id = ctx.id.0, "Fetch stage timed out");
            return TaskOutcome::Cancelled;
        }
    };

    if ctx.cancel_token.is_cancelled() {
        return TaskOutcome::Cancelled;
    }

    // --- Merging ---
    if let Err(e) = ctx.db.set_state(ctx.id, TaskState::Merging).await {
        return db_failure(TaskState::Merging, e);
    }
    ctx.emit(Event::StageStarted {
        id: ctx.id,
        owner_scope: ctx.owner_scope,
        state: TaskState::Merging,
    });

    let merged = match run_with_timeout(
        ctx.config.timeouts.merge,
        &ctx.cancel_token,
        merge_stage(ctx, work_dir, &fetched),
    )
    .await
    {
        StageResult::Completed(Ok(merged)) => merged,
        StageResult::Completed(Err(e)) => return classify(ctx, TaskState::Merging, e),
        StageResult::TimedOut => {
            tracing::info!(task_id = ctx.id.0, "Merge stage timed out");
            return TaskOutcome::Cancelled;
        }
    };

    if ctx.cancel_token.is_cancelled() {
        return TaskOutcome::Cancelled;
    }

    // --- Publishing ---
    if let Err(e) = ctx.db.set_state(ctx.id, TaskState::Publishing).await {
        return db_failure(TaskState::Publishing, e);
    }
    ctx.emit(Event::StageStarted {
        id: ctx.id,
        owner_scope: ctx.owner_scope,
        state: TaskState::Publishing,
    });

    match run_with_timeout(
        ctx.config.timeouts.publish,
        &ctx.cancel_token,
        publish_stage(ctx, &merged),
    )
    .await
    {
        StageResult::Completed(outcome) => outcome,
        StageResult::TimedOut => {
            tracing::info!(task_id = ctx.id.0, "Publish stage timed out");
            TaskOutcome::Cancelled
        }
    }
}

/// Fetch all sources into the working directory, bounded by the fetch fanout
///
/// Results come back in submission order regardless of completion order;
/// the first failed source aborts the stage.
async fn fetch_stage(ctx: &TaskContext, work_dir: &Path) -> Result<Vec<FetchedFile>, Error> {
    let source_count = ctx.inputs.len();

    // Per-source (downloaded, total) for size-weighted overall progress
    let byte_progress: Arc<std::sync::Mutex<Vec<(u64, Option<u64>)>>> =
        Arc::new(std::sync::Mutex::new(vec![(0, None); source_count]));
    let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let futures = ctx.inputs.iter().enumerate().map(|(index, source)| {
        let byte_progress = byte_progress.clone();
        let completed = completed.clone();

        async move {
            let fetcher = ctx
                .stages
                .fetchers
                .iter()
                .find(|f| f.supports(source))
                .ok_or_else(|| {
                    Error::SourceFetch(crate::error::SourceFetchError::Unsupported(
                        source.label().to_string(),
                    ))
                })?;

            let progress_cb = {
                let byte_progress = byte_progress.clone();
                let event_tx = ctx.event_tx.clone();
                let id = ctx.id;
                let owner_scope = ctx.owner_scope;

                move |downloaded: u64, total: Option<u64>| {
                    let Ok(mut slots) = byte_progress.lock() else {
                        return;
                    };
                    slots[index] = (downloaded, total);
                    let (fraction, downloaded_bytes) = overall_fetch_progress(&slots);
                    drop(slots);
                    event_tx
                        .send(Event::FetchProgress {
                            id,
                            owner_scope,
                            fraction,
                            downloaded_bytes,
                        })
                        .ok();
                }
            };

            let file = retry_with_backoff(&ctx.config.fetch_retry, || {
                fetcher.fetch(source, work_dir, &ctx.cancel_token, &progress_cb)
            })
            .await
            .map_err(Error::SourceFetch)?;

            // A finished source counts as fully known even when the server
            // never sent a Content-Length
            if let Ok(mut slots) = byte_progress.lock() {
                slots[index] = (file.size, Some(file.size));
            }

            let done = completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            let label = format!("fetching {done}/{source_count}");
            if let Err(e) = ctx
                .db
                .update_progress(ctx.id, done as f32 / source_count as f32, &label)
                .await
            {
                tracing::debug!(task_id = ctx.id.0, error = %e, "Progress write failed");
            }

            tracing::info!(
                task_id = ctx.id.0,
                source = source.label(),
                bytes = file.size,
                "Source fetched"
            );

            Ok::<_, Error>((index, file))
        }
    });
    // Materialize the futures; a lazy map here makes the worker future !Send
    let futures: Vec<_> = futures.collect();

    let mut indexed: Vec<(usize, FetchedFile)> = Vec::with_capacity(source_count);
    let mut stream =
        futures::stream::iter(futures).buffer_unordered(ctx.config.limits.fetch_fanout.max(1));
    while let Some(result) = stream.next().await {
        indexed.push(result?);
    }
    drop(stream);

    // Merge order is submission order, never completion order
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, file)| file).collect())
}

/// Overall fetch fraction across all sources
///
/// Size-weighted when every source declared a total; count-weighted over
/// per-source fractions otherwise (a source with an unknown total counts as
/// 0 until it finishes, at which point its slot carries the final size).
fn overall_fetch_progress(slots: &[(u64, Option<u64>)]) -> (f32, u64) {
    let downloaded: u64 = slots.iter().map(|(d, _)| d).sum();
    let total: Option<u64> = slots
        .iter()
        .map(|(_, t)| *t)
        .try_fold(0u64, |acc, t| t.map(|t| acc + t));

    let fraction = match total {
        Some(total) if total > 0 => (downloaded as f32 / total as f32).min(1.0),
        _ => {
            let sum: f32 = slots
                .iter()
                .map(|(d, t)| match t {
                    Some(t) if *t > 0 => (*d as f32 / *t as f32).min(1.0),
                    _ => 0.0,
                })
                .sum();
            sum / slots.len().max(1) as f32
        }
    };
    (fraction, downloaded)
}

/// Run the merge engine over the fetched inputs, flushing progress to the
/// database on a fixed interval
async fn merge_stage(
    ctx: &TaskContext,
    work_dir: &Path,
    fetched: &[FetchedFile],
) -> Result<MergedOutput, Error> {
    let inputs: Vec<PathBuf> = fetched.iter().map(|f| f.path.clone()).collect();
    let output_path = work_dir.join(format!(
        "{}_{}.{}",
        ctx.config.merge.output_prefix, ctx.id.0, ctx.config.merge.output_container
    ));

    let latest: Arc<std::sync::Mutex<MergeProgress>> =
        Arc::new(std::sync::Mutex::new(MergeProgress::default()));

    let progress_cb = {
        let latest = latest.clone();
        let event_tx = ctx.event_tx.clone();
        let id = ctx.id;
        let owner_scope = ctx.owner_scope;

        move |p: MergeProgress| {
            if let Ok(mut latest) = latest.lock() {
                *latest = p;
            }
            event_tx
                .send(Event::MergeProgress {
                    id,
                    owner_scope,
                    fraction: p.fraction,
                    elapsed_secs: p.elapsed_secs,
                    eta_secs: p.eta_secs,
                    output_bytes: p.output_bytes,
                })
                .ok();
        }
    };

    let merge_future = ctx
        .stages
        .engine
        .merge(&inputs, &output_path, &ctx.cancel_token, &progress_cb);
    tokio::pin!(merge_future);

    let mut flush = tokio::time::interval(MERGE_PROGRESS_FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            result = &mut merge_future => {
                let merged = result.map_err(Error::MergeEngine)?;
                tracing::info!(
                    task_id = ctx.id.0,
                    output = %merged.path.display(),
                    bytes = merged.size,
                    "Merge complete"
                );
                return Ok(merged);
            }
            _ = flush.tick() => {
                let fraction = latest.lock().map(|p| p.fraction).unwrap_or(0.0);
                if let Err(e) = ctx.db.update_progress(ctx.id, fraction, "merging").await {
                    tracing::debug!(task_id = ctx.id.0, error = %e, "Progress write failed");
                }
            }
        }
    }
}

/// Deliver the artifact to every destination; the task succeeds if at least
/// one delivery lands
///
/// Deliveries run in registration order with a cancellation check between
/// destinations. Outcomes already recorded survive a mid-stage cancel.
async fn publish_stage(ctx: &TaskContext, merged: &MergedOutput) -> TaskOutcome {
    let mut artifacts = Artifacts::new();
    let total = ctx.stages.destinations.len();

    for destination in ctx.stages.destinations.iter() {
        if ctx.cancel_token.is_cancelled() {
            persist_artifacts(ctx, &artifacts).await;
            return TaskOutcome::Cancelled;
        }

        let name = destination.name().to_string();
        ctx.emit(Event::PublishProgress {
            id: ctx.id,
            owner_scope: ctx.owner_scope,
            destination: name.clone(),
            completed: artifacts.len(),
            total,
        });

        let outcome = if !destination.accepts(merged.size) {
            Err(format!(
                "artifact is {} bytes, over this destination's limit",
                merged.size
            ))
        } else {
            retry_with_backoff(&ctx.config.publish_retry, || {
                destination.deliver(&merged.path, &ctx.cancel_token)
            })
            .await
            .map_err(|e| e.to_string())
        };

        match outcome {
            Ok(reference) => {
                tracing::info!(
                    task_id = ctx.id.0,
                    destination = %name,
                    reference = %reference,
                    "Artifact delivered"
                );
                ctx.emit(Event::Delivered {
                    id: ctx.id,
                    owner_scope: ctx.owner_scope,
                    destination: name.clone(),
                    reference: reference.clone(),
                });
                artifacts.insert(name, DeliveryOutcome::Delivered { reference });
            }
            Err(reason) => {
                tracing::warn!(
                    task_id = ctx.id.0,
                    destination = %name,
                    error = %reason,
                    "Delivery failed"
                );
                ctx.emit(Event::DeliveryFailed {
                    id: ctx.id,
                    owner_scope: ctx.owner_scope,
                    destination: name.clone(),
                    error: reason.clone(),
                });
                artifacts.insert(name, DeliveryOutcome::Failed { reason });
            }
        }

        persist_artifacts(ctx, &artifacts).await;
    }

    let any_delivered = artifacts
        .values()
        .any(|o| matches!(o, DeliveryOutcome::Delivered { .. }));

    // A latched cancel outranks a delivery that landed in the same instant;
    // the recorded outcomes stay in the artifact map either way
    if ctx.cancel_token.is_cancelled() {
        TaskOutcome::Cancelled
    } else if any_delivered {
        TaskOutcome::Succeeded(artifacts)
    } else {
        TaskOutcome::Failed {
            stage: TaskState::Publishing,
            error: "all destinations failed".to_string(),
        }
    }
}

async fn persist_artifacts(ctx: &TaskContext, artifacts: &Artifacts) {
    if let Err(e) = ctx.db.set_artifacts(ctx.id, artifacts).await {
        tracing::error!(task_id = ctx.id.0, error = %e, "Failed to persist artifacts");
    }
}

/// Record the terminal state, emit the terminal event, and release the
/// worker slot
async fn finalize(ctx: &TaskContext, outcome: TaskOutcome) {
    let result = match &outcome {
        TaskOutcome::Succeeded(artifacts) => {
            ctx.db
                .update_progress(ctx.id, 1.0, "done")
                .await
                .and(ctx.db.mark_terminal(ctx.id, TaskState::Succeeded, None).await)
                .map(|()| {
                    ctx.emit(Event::Succeeded {
                        id: ctx.id,
                        owner_scope: ctx.owner_scope,
                        artifacts: artifacts.clone(),
                    });
                    tracing::info!(task_id = ctx.id.0, "Task succeeded");
                })
        }
        TaskOutcome::Cancelled => {
            ctx.db
                .mark_terminal(ctx.id, TaskState::Cancelled, None)
                .await
                .map(|()| {
                    ctx.emit(Event::Cancelled {
                        id: ctx.id,
                        owner_scope: ctx.owner_scope,
                    });
                    tracing::info!(task_id = ctx.id.0, "Task cancelled");
                })
        }
        TaskOutcome::Failed { stage, error } => {
            ctx.db
                .mark_terminal(ctx.id, TaskState::Failed, Some(error))
                .await
                .map(|()| {
                    ctx.emit(Event::Failed {
                        id: ctx.id,
                        owner_scope: ctx.owner_scope,
                        stage: *stage,
                        error: error.clone(),
                    });
                    tracing::error!(
                        task_id = ctx.id.0,
                        stage = ?stage,
                        error = %error,
                        "Task failed"
                    );
                })
        }
    };

    if let Err(e) = result {
        tracing::error!(task_id = ctx.id.0, error = %e, "Failed to record terminal state");
    }

    remove_from_active(ctx).await;
}

async fn remove_from_active(ctx: &TaskContext) {
    let mut active = ctx.active_tasks.lock().await;
    active.remove(&ctx.id);
}

/// Classify a stage error: a failure after the cancel token fired is a
/// cancellation, not a task failure
fn classify(ctx: &TaskContext, stage: TaskState, error: Error) -> TaskOutcome {
    if ctx.cancel_token.is_cancelled() {
        TaskOutcome::Cancelled
    } else {
        TaskOutcome::Failed {
            stage,
            error: error.to_string(),
        }
    }
}

fn db_failure(stage: TaskState, error: Error) -> TaskOutcome {
    TaskOutcome::Failed {
        stage,
        error: error.to_string(),
    }
}

/// Outcome of racing a stage against its configured timeout
enum StageResult<T> {
    Completed(T),
    TimedOut,
}

/// Run a stage under its optional timeout
///
/// A timeout fires the task's cancel token so in-flight work (downloads,
/// the engine process) stops, then reports TimedOut; the caller treats it
/// exactly like a cancellation.
async fn run_with_timeout<F>(
    limit: Option<Duration>,
    cancel: &CancellationToken,
    future: F,
) -> StageResult<F::Output>
where
    F: std::future::Future,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(output) => StageResult::Completed(output),
            Err(_) => {
                cancel.cancel();
                StageResult::TimedOut
            }
        },
        None => StageResult::Completed(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::overall_fetch_progress;

    #[test]
    fn fetch_progress_is_size_weighted_when_all_totals_are_known() {
        let slots = [(50, Some(100)), (300, Some(300))];
        let (fraction, downloaded) = overall_fetch_progress(&slots);
        assert_eq!(downloaded, 350);
        assert!((fraction - 0.875).abs() < 1e-6);
    }

    #[test]
    fn fetch_progress_falls_back_to_count_weighting_on_unknown_totals() {
        // One source done, one with no declared total
        let slots = [(100, Some(100)), (40, None)];
        let (fraction, downloaded) = overall_fetch_progress(&slots);
        assert_eq!(downloaded, 140);
        assert!((fraction - 0.5).abs() < 1e-6);
    }

    #[test]
    fn fetch_progress_handles_empty_and_zero_totals() {
        assert_eq!(overall_fetch_progress(&[]).0, 0.0);
        assert_eq!(overall_fetch_progress(&[(0, Some(0))]).0, 0.0);
    }
}
