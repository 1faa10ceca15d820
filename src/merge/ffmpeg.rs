//! ffmpeg-backed merge engine.
//!
//! Concatenates inputs losslessly with the concat demuxer (`-f concat
//! -c copy`). A pre-pass sums the input durations with ffprobe so the
//! engine's `out_time` reports can be turned into a completion fraction.

use crate::config::MergeConfig;
use crate::error::MergeEngineError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{MergeEngine, MergeProgress, MergeProgressFn, MergedOutput};

/// Lines of engine stderr kept for the failure diagnostic
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Merge engine backed by the ffmpeg and ffprobe binaries
#[derive(Debug)]
pub struct FfmpegMergeEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    out_time_re: Regex,
}

impl FfmpegMergeEngine {
    /// Locate the binaries per the merge configuration
    ///
    /// Explicit paths win; otherwise the system PATH is searched.
    pub fn discover(config: &MergeConfig) -> Result<Self, MergeEngineError> {
        let ffmpeg = Self::locate("ffmpeg", config.ffmpeg_path.as_deref(), config.search_path)?;
        let ffprobe = Self::locate("ffprobe", config.ffprobe_path.as_deref(), config.search_path)?;

        tracing::info!(
            ffmpeg = %ffmpeg.display(),
            ffprobe = %ffprobe.display(),
            "Merge engine binaries located"
        );

        Ok(Self::with_binaries(ffmpeg, ffprobe))
    }

    /// Create an engine with explicit binary paths
    pub fn with_binaries(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            // e.g. "out_time=00:05:32.480000"
            #[allow(clippy::expect_used)]
            out_time_re: Regex::new(r"^out_time=(\d+):(\d{2}):(\d{2})\.(\d+)")
                .expect("static regex"),
        }
    }

    fn locate(
        name: &str,
        explicit: Option<&Path>,
        search_path: bool,
    ) -> Result<PathBuf, MergeEngineError> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(MergeEngineError::SpawnFailed(format!(
                "{name} not found at configured path {}",
                path.display()
            )));
        }

        if search_path {
            return which::which(name).map_err(|e| {
                MergeEngineError::SpawnFailed(format!("{name} not found on PATH: {e}"))
            });
        }

        Err(MergeEngineError::SpawnFailed(format!(
            "no path configured for {name} and PATH search is disabled"
        )))
    }

    /// Sum the durations of all inputs, in seconds
    ///
    /// Inputs whose duration cannot be determined are skipped; progress just
    /// becomes less accurate for that run.
    async fn total_duration(&self, inputs: &[PathBuf]) -> Result<f64, MergeEngineError> {
        let mut total = 0.0;

        for input in inputs {
            let output = Command::new(&self.ffprobe)
                .args(["-v", "quiet", "-show_entries", "format=duration", "-of", "csv=p=0"])
                .arg(input)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| MergeEngineError::ProbeFailed {
                    path: input.clone(),
                    reason: format!("failed to run ffprobe: {e}"),
                })?;

            if !output.status.success() {
                tracing::warn!(
                    input = %input.display(),
                    "ffprobe could not determine duration, progress will be approximate"
                );
                continue;
            }

            match String::from_utf8_lossy(&output.stdout).trim().parse::<f64>() {
                Ok(duration) => total += duration,
                Err(_) => {
                    tracing::warn!(
                        input = %input.display(),
                        "unparsable duration from ffprobe"
                    );
                }
            }
        }

        Ok(total)
    }

    fn parse_out_time_secs(&self, line: &str) -> Option<f64> {
        let caps = self.out_time_re.captures(line)?;
        let hours: f64 = caps[1].parse().ok()?;
        let minutes: f64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        Some(hours * 3600.0 + minutes * 60.0 + seconds)
    }
}

/// Write the concat demuxer list file, quoting paths for its parser
async fn write_concat_list(
    list_path: &Path,
    inputs: &[PathBuf],
) -> Result<(), MergeEngineError> {
    let mut contents = String::new();
    for input in inputs {
        let escaped = input.display().to_string().replace('\'', "'\\''");
        contents.push_str(&format!("file '{escaped}'\n"));
    }

    tokio::fs::write(list_path, contents)
        .await
        .map_err(|e| MergeEngineError::SpawnFailed(format!("failed to write concat list: {e}")))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}

#[async_trait]
impl MergeEngine for FfmpegMergeEngine {
    async fn merge(
        &self,
        inputs: &[PathBuf],
        output_path: &Path,
        cancel: &CancellationToken,
        progress: &MergeProgressFn,
    ) -> Result<MergedOutput, MergeEngineError> {
        let total_duration = self.total_duration(inputs).await?;

        let list_path = output_path.with_extension("inputs.txt");
        write_concat_list(&list_path, inputs).await?;

        let mut child = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            // No -f: the muxer follows the output path's extension, which the
            // worker derives from the configured container
            .args(["-map", "0", "-c", "copy"])
            .args(["-progress", "pipe:1"])
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MergeEngineError::SpawnFailed(e.to_string()))?;

        // Drain stderr concurrently, keeping only the tail for diagnostics
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == DIAGNOSTIC_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let stdout = child.stdout.take();
        let started = Instant::now();
        let mut output_bytes: Option<u64> = None;

        let status = {
            let mut lines = stdout.map(|s| BufReader::new(s).lines());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Cancellation requested, killing merge engine");
                        if let Err(e) = child.kill().await {
                            tracing::warn!(error = %e, "Failed to kill merge engine");
                        }
                        stderr_task.abort();
                        remove_quietly(&list_path).await;
                        remove_quietly(output_path).await;
                        return Err(MergeEngineError::EngineFailed {
                            code: None,
                            diagnostic: "cancelled".to_string(),
                        });
                    }

                    line = async {
                        match lines.as_mut() {
                            Some(lines) => lines.next_line().await,
                            None => Ok(None),
                        }
                    } => {
                        match line {
                            Ok(Some(line)) => {
                                if let Some(secs) = self.parse_out_time_secs(&line) {
                                    let fraction = if total_duration > 0.0 {
                                        (secs / total_duration).min(1.0) as f32
                                    } else {
                                        0.0
                                    };
                                    let wall = started.elapsed().as_secs_f64();
                                    let eta_secs = if fraction > 0.01 {
                                        Some((wall / f64::from(fraction) - wall) as u64)
                                    } else {
                                        None
                                    };

                                    progress(MergeProgress {
                                        fraction,
                                        elapsed_secs: secs as u64,
                                        eta_secs,
                                        output_bytes,
                                    });
                                } else if let Some(size) = line
                                    .strip_prefix("total_size=")
                                    .and_then(|s| s.parse().ok())
                                {
                                    output_bytes = Some(size);
                                }
                            }
                            // Progress stream closed; wait for the exit status
                            Ok(None) | Err(_) => break child.wait().await,
                        }
                    }
                }
            }
        };

        remove_quietly(&list_path).await;

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                stderr_task.abort();
                remove_quietly(output_path).await;
                return Err(MergeEngineError::SpawnFailed(format!(
                    "failed to wait for merge engine: {e}"
                )));
            }
        };

        let diagnostic = stderr_task.await.unwrap_or_default();

        if !status.success() {
            remove_quietly(output_path).await;
            return Err(MergeEngineError::EngineFailed {
                code: status.code(),
                diagnostic,
            });
        }

        // Exit 0 alone is not success: the output must exist and be non-empty
        let size = match tokio::fs::metadata(output_path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => {
                remove_quietly(output_path).await;
                return Err(MergeEngineError::MissingOutput {
                    path: output_path.to_path_buf(),
                });
            }
        };

        Ok(MergedOutput {
            path: output_path.to_path_buf(),
            size,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FfmpegMergeEngine {
        FfmpegMergeEngine::with_binaries(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"))
    }

    #[test]
    fn parses_out_time_lines() {
        let e = engine();
        assert_eq!(
            e.parse_out_time_secs("out_time=00:05:32.480000"),
            Some(332.0)
        );
        assert_eq!(e.parse_out_time_secs("out_time=01:00:00.000000"), Some(3600.0));
        assert_eq!(e.parse_out_time_secs("frame=100"), None);
        assert_eq!(e.parse_out_time_secs("progress=continue"), None);
    }

    #[tokio::test]
    async fn concat_list_quotes_single_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("inputs.txt");
        let inputs = vec![
            PathBuf::from("/work/task_1/part one.mp4"),
            PathBuf::from("/work/task_1/it's here.mp4"),
        ];

        write_concat_list(&list, &inputs).await.unwrap();

        let contents = std::fs::read_to_string(&list).unwrap();
        assert_eq!(
            contents,
            "file '/work/task_1/part one.mp4'\nfile '/work/task_1/it'\\''s here.mp4'\n"
        );
    }

    #[test]
    fn explicit_missing_binary_path_is_a_spawn_error() {
        let config = MergeConfig {
            ffmpeg_path: Some(PathBuf::from("/nonexistent/ffmpeg")),
            ..Default::default()
        };
        let err = FfmpegMergeEngine::discover(&config).unwrap_err();
        assert!(matches!(err, MergeEngineError::SpawnFailed(_)));
    }

    #[test]
    fn disabled_path_search_without_explicit_path_fails() {
        let config = MergeConfig {
            search_path: false,
            ..Default::default()
        };
        let err = FfmpegMergeEngine::discover(&config).unwrap_err();
        assert!(err.to_string().contains("PATH search is disabled"), "got: {err}");
    }

    #[cfg(unix)]
    mod fake_engine {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::{Arc, Mutex};

        fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn fake_ffprobe(dir: &Path) -> PathBuf {
            write_script(dir, "ffprobe", "echo 5.0")
        }

        #[tokio::test]
        async fn successful_merge_reports_progress_and_output() {
            let dir = tempfile::tempdir().unwrap();

            // Last argument is the output path; emit one progress report
            let ffmpeg = write_script(
                dir.path(),
                "ffmpeg",
                r#"for last; do :; done
printf 'out_time=00:00:05.000000\nprogress=continue\n'
printf 'merged' > "$last"
printf 'progress=end\n'"#,
            );
            let ffprobe = fake_ffprobe(dir.path());

            let engine = FfmpegMergeEngine::with_binaries(ffmpeg, ffprobe);
            let inputs = vec![dir.path().join("a.mp4"), dir.path().join("b.mp4")];
            let output = dir.path().join("merged.mkv");

            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen_clone = seen.clone();
            let progress = move |p: MergeProgress| seen_clone.lock().unwrap().push(p);

            let merged = engine
                .merge(&inputs, &output, &CancellationToken::new(), &progress)
                .await
                .unwrap();

            assert_eq!(merged.path, output);
            assert_eq!(merged.size, 6);

            let seen = seen.lock().unwrap();
            assert!(!seen.is_empty());
            // Two 5s inputs, 5s produced: halfway
            assert!((seen[0].fraction - 0.5).abs() < 0.01);
            assert_eq!(seen[0].elapsed_secs, 5);

            // Concat list must be cleaned up
            assert!(!output.with_extension("inputs.txt").exists());
        }

        #[tokio::test]
        async fn muxer_is_inferred_from_the_output_extension() {
            let dir = tempfile::tempdir().unwrap();
            let args_file = dir.path().join("args.txt");

            // Record the full argument list, then produce the output
            let ffmpeg = write_script(
                dir.path(),
                "ffmpeg",
                &format!(
                    r#"printf '%s\n' "$@" > '{}'
for last; do :; done
printf 'merged' > "$last""#,
                    args_file.display()
                ),
            );
            let ffprobe = fake_ffprobe(dir.path());

            let engine = FfmpegMergeEngine::with_binaries(ffmpeg, ffprobe);
            let output = dir.path().join("merged.mp4");
            engine
                .merge(
                    &[dir.path().join("a.mp4")],
                    &output,
                    &CancellationToken::new(),
                    &|_| {},
                )
                .await
                .unwrap();

            let args: Vec<String> = std::fs::read_to_string(&args_file)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect();

            // The only format override is the concat demuxer on the input
            // side; the output muxer comes from the .mp4 extension
            let format_args: Vec<&str> = args
                .windows(2)
                .filter(|w| w[0] == "-f")
                .map(|w| w[1].as_str())
                .collect();
            assert_eq!(format_args, vec!["concat"]);
            assert_eq!(args.last().map(String::as_str), output.to_str());
        }

        #[tokio::test]
        async fn nonzero_exit_surfaces_stderr_tail() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = write_script(
                dir.path(),
                "ffmpeg",
                r#"echo 'Invalid data found when processing input' >&2
exit 1"#,
            );
            let ffprobe = fake_ffprobe(dir.path());

            let engine = FfmpegMergeEngine::with_binaries(ffmpeg, ffprobe);
            let output = dir.path().join("merged.mkv");

            let err = engine
                .merge(
                    &[dir.path().join("a.mp4")],
                    &output,
                    &CancellationToken::new(),
                    &|_| {},
                )
                .await
                .unwrap_err();

            match err {
                MergeEngineError::EngineFailed { code, diagnostic } => {
                    assert_eq!(code, Some(1));
                    assert!(diagnostic.contains("Invalid data found"), "got: {diagnostic}");
                }
                other => panic!("expected EngineFailed, got {other:?}"),
            }
            assert!(!output.exists());
        }

        #[tokio::test]
        async fn clean_exit_without_output_is_missing_output() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = write_script(dir.path(), "ffmpeg", "exit 0");
            let ffprobe = fake_ffprobe(dir.path());

            let engine = FfmpegMergeEngine::with_binaries(ffmpeg, ffprobe);
            let output = dir.path().join("merged.mkv");

            let err = engine
                .merge(
                    &[dir.path().join("a.mp4")],
                    &output,
                    &CancellationToken::new(),
                    &|_| {},
                )
                .await
                .unwrap_err();

            assert!(matches!(err, MergeEngineError::MissingOutput { .. }), "got: {err:?}");
        }

        #[tokio::test]
        async fn cancellation_kills_the_engine_and_removes_output() {
            let dir = tempfile::tempdir().unwrap();
            // Engine that writes a partial file then stalls
            let ffmpeg = write_script(
                dir.path(),
                "ffmpeg",
                r#"for last; do :; done
printf 'partial' > "$last"
sleep 30"#,
            );
            let ffprobe = fake_ffprobe(dir.path());

            let engine = FfmpegMergeEngine::with_binaries(ffmpeg, ffprobe);
            let output = dir.path().join("merged.mkv");
            let cancel = CancellationToken::new();

            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                cancel_clone.cancel();
            });

            let start = Instant::now();
            let err = engine
                .merge(
                    &[dir.path().join("a.mp4")],
                    &output,
                    &cancel,
                    &|_| {},
                )
                .await
                .unwrap_err();

            assert!(start.elapsed() < std::time::Duration::from_secs(10), "engine was not killed");
            assert!(err.to_string().contains("cancelled"), "got: {err}");
            assert!(!output.exists(), "partial output must be removed");
        }
    }
}
