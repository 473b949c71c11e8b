//! Per-run logging setup and stage-bracketing helpers.
//!
//! The source pipeline colorizes console output by level and by stage
//! (`PipelineFormatter`, `COLORS`, `STAGE_COLORS`) and writes two kinds of
//! file sink: one whole-run log and one log per stage. `tracing-subscriber`
//! gives us the same shape with layered subscribers instead of a custom
//! `logging.Formatter`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::state::Stage;
use common::reporting::SharedStats;

/// Installs the run's subscriber: a colorized console sink plus a
/// `logs/<run_id>.log` file sink, both filtered by `RUST_LOG` (default
/// `info`). The run's whole-run log file is kept open for the process
/// lifetime, matching the source pipeline's one-file-handle-per-run logger.
pub fn init_run_logging(work_dir: &Path, run_id: &str) -> std::io::Result<()> {
    let logs_dir = work_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(format!("{run_id}.log")))?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_ansi(true)
        .with_writer(std::io::stdout);

    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(())
}

/// Path a stage-scoped log would live at, `logs/<run_id>.<stage>.log`.
/// Stage runners that want a dedicated file sink open this path directly
/// rather than installing a second global subscriber.
#[must_use]
pub fn stage_log_path(work_dir: &Path, run_id: &str, stage: Stage) -> PathBuf {
    work_dir.join("logs").join(format!("{run_id}.{stage}.log"))
}

/// Logs the start of `stage` and returns a timer to pass to [`stage_complete`]
/// or [`stage_failed`].
pub fn stage_start(stage: Stage) -> Instant {
    info!(stage = %stage, "stage started");
    Instant::now()
}

/// Logs stage completion, records the duration into `stats`, and warns
/// instead of merely informing when any items failed.
pub async fn stage_complete(
    stage: Stage,
    started: Instant,
    processed: usize,
    failed: usize,
    stats: &SharedStats,
) {
    let elapsed = started.elapsed();
    stats
        .lock()
        .await
        .record_stage_duration(stage.as_str(), elapsed);
    if failed > 0 {
        warn!(
            stage = %stage,
            processed,
            failed,
            duration = ?elapsed,
            "stage completed with failures"
        );
    } else {
        info!(stage = %stage, processed, duration = ?elapsed, "stage completed");
    }
}

pub async fn stage_failed(stage: Stage, started: Instant, error: &str, stats: &SharedStats) {
    let elapsed = started.elapsed();
    let mut guard = stats.lock().await;
    guard.record_stage_duration(stage.as_str(), elapsed);
    guard.record_error(format!("{stage}: {error}"));
    drop(guard);
    tracing::error!(stage = %stage, duration = ?elapsed, error, "stage failed");
}

/// Formats the run's planned stage sequence for the opening log line, e.g.
/// `"export -> extract -> dedupe -> build"`.
#[must_use]
pub fn format_plan(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(Stage::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[must_use]
pub fn format_total_duration(duration: Duration) -> String {
    common::reporting::format_duration(duration)
}
