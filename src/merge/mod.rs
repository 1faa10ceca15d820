//! Merging fetched inputs into a single output via an external engine.
//!
//! The [`MergeEngine`] trait hides the engine behind a seam so the pipeline
//! can be tested without ffmpeg installed; [`FfmpegMergeEngine`] is the real
//! implementation.

mod ffmpeg;

pub use ffmpeg::FfmpegMergeEngine;

use crate::error::MergeEngineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Incremental merge progress, derived from the engine's own reporting
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeProgress {
    /// Fraction of total output duration produced (0.0 to 1.0)
    pub fraction: f32,
    /// Seconds of output produced so far
    pub elapsed_secs: u64,
    /// Estimated wall-clock seconds remaining (None early in the run)
    pub eta_secs: Option<u64>,
    /// Output size in bytes so far, if the engine reports it
    pub output_bytes: Option<u64>,
}

/// Progress callback invoked as the engine reports output time
pub type MergeProgressFn = dyn Fn(MergeProgress) + Send + Sync;

/// The merged artifact
#[derive(Debug, Clone)]
pub struct MergedOutput {
    /// Where the output was written
    pub path: PathBuf,
    /// Size on disk in bytes
    pub size: u64,
}

/// Merges ordered input files into a single output file
///
/// Engine failures are always fatal to the task; the orchestrator never
/// retries a merge.
#[async_trait]
pub trait MergeEngine: Send + Sync {
    /// Merge `inputs` (in order) into `output_path`
    ///
    /// Implementations must kill the engine process when `cancel` fires and
    /// must not leave a partial output file behind on any failure path.
    async fn merge(
        &self,
        inputs: &[PathBuf],
        output_path: &Path,
        cancel: &CancellationToken,
        progress: &MergeProgressFn,
    ) -> Result<MergedOutput, MergeEngineError>;
}
