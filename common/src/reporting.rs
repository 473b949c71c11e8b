//! Run-level statistics accumulation and the end-of-run summary report.
//!
//! Mirrors the shape of the stage/operation instrumentation used throughout
//! the pipeline: every LLM call, embedding call, file read and file write is
//! wrapped in [`time_operation`], and the accumulated [`PipelineStats`] is
//! rendered into a human-readable report via [`PipelineStats::summary_report`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

/// Canonical operation names the summary report aggregates separately.
pub const OP_LLM_CALL: &str = "llm_call";
pub const OP_EMBEDDING_CALL: &str = "embedding_call";
pub const OP_FILE_READ: &str = "file_read";
pub const OP_FILE_WRITE: &str = "file_write";

const WELL_KNOWN_OPERATIONS: [&str; 4] =
    [OP_LLM_CALL, OP_EMBEDDING_CALL, OP_FILE_READ, OP_FILE_WRITE];

/// One timed unit of work, recorded for the slowest-operations report.
#[derive(Debug, Clone)]
pub struct OperationTiming {
    pub name: String,
    pub duration: Duration,
    pub stage: Option<String>,
    pub details: Value,
}

/// Aggregate stats for every timing matching a given operation name.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationSummary {
    pub count: usize,
    pub total: Duration,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// Accumulated statistics for a single pipeline run.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub stage_durations: HashMap<String, Duration>,
    pub operation_timings: Vec<OperationTiming>,
    pub threads_processed: u64,
    pub entries_processed: u64,
    pub documents_exported: u64,
    pub chunks_created: u64,
    pub entities_extracted: u64,
    pub relations_extracted: u64,
    pub entities_deduplicated: u64,
    pub embeddings_generated: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PipelineStats {
    pub fn record_stage_duration(&mut self, stage: &str, duration: Duration) {
        self.stage_durations.insert(stage.to_string(), duration);
    }

    pub fn record_timing(
        &mut self,
        name: impl Into<String>,
        duration: Duration,
        stage: Option<&str>,
        details: Value,
    ) {
        self.operation_timings.push(OperationTiming {
            name: name.into(),
            duration,
            stage: stage.map(str::to_string),
            details,
        });
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Returns the `n` slowest operations by wall-clock duration, descending.
    #[must_use]
    pub fn slowest_operations(&self, n: usize) -> Vec<&OperationTiming> {
        let mut timings: Vec<&OperationTiming> = self.operation_timings.iter().collect();
        timings.sort_by(|a, b| b.duration.cmp(&a.duration));
        timings.truncate(n);
        timings
    }

    /// Aggregates every timing whose name equals `name`.
    #[must_use]
    pub fn operation_summary(&self, name: &str) -> Option<OperationSummary> {
        let matching: Vec<Duration> = self
            .operation_timings
            .iter()
            .filter(|t| t.name == name)
            .map(|t| t.duration)
            .collect();
        if matching.is_empty() {
            return None;
        }
        let count = matching.len();
        let total: Duration = matching.iter().sum();
        let min = *matching.iter().min()?;
        let max = *matching.iter().max()?;
        let avg = total / u32::try_from(count).unwrap_or(1);
        Some(OperationSummary {
            count,
            total,
            avg,
            min,
            max,
        })
    }

    /// Renders the full end-of-run human-readable report as a single string
    /// with embedded newlines; callers log it line-by-line.
    #[must_use]
    pub fn summary_report(&self, total_duration: Duration) -> String {
        let mut lines = Vec::new();
        lines.push("=".repeat(60));
        lines.push("PIPELINE SUMMARY".to_string());
        lines.push("=".repeat(60));
        lines.push(format!("Total duration: {}", format_duration(total_duration)));

        lines.push(String::new());
        lines.push("STAGE TIMINGS".to_string());
        let total_secs = total_duration.as_secs_f64().max(f64::EPSILON);
        let mut stages: Vec<(&String, &Duration)> = self.stage_durations.iter().collect();
        stages.sort_by_key(|(name, _)| (*name).clone());
        for (stage, duration) in stages {
            let pct = 100.0 * duration.as_secs_f64() / total_secs;
            lines.push(format!(
                "  {stage:<10} {:>10}  ({pct:>5.1}%)",
                format_duration(*duration)
            ));
        }

        lines.push(String::new());
        lines.push("PROCESSING STATS".to_string());
        lines.push(format!("  threads_processed:     {:>8}", self.threads_processed));
        lines.push(format!("  entries_processed:     {:>8}", self.entries_processed));
        lines.push(format!("  documents_exported:    {:>8}", self.documents_exported));
        lines.push(format!("  chunks_created:        {:>8}", self.chunks_created));
        lines.push(format!("  entities_extracted:    {:>8}", self.entities_extracted));
        lines.push(format!("  relations_extracted:   {:>8}", self.relations_extracted));
        lines.push(format!(
            "  entities_deduplicated: {:>8}",
            self.entities_deduplicated
        ));
        lines.push(format!(
            "  embeddings_generated:  {:>8}",
            self.embeddings_generated
        ));

        lines.push(String::new());
        lines.push("SLOWEST OPERATIONS".to_string());
        for timing in self.slowest_operations(5) {
            lines.push(format!(
                "  {:<20} {:>10}  stage={}",
                timing.name,
                format_duration(timing.duration),
                timing.stage.as_deref().unwrap_or("-")
            ));
        }

        for name in WELL_KNOWN_OPERATIONS {
            if let Some(summary) = self.operation_summary(name) {
                lines.push(String::new());
                lines.push(format!("{name}: count={}", summary.count));
                lines.push(format!(
                    "  total={} avg={} min={} max={}",
                    format_duration(summary.total),
                    format_duration(summary.avg),
                    format_duration(summary.min),
                    format_duration(summary.max),
                ));
            }
        }

        if !self.errors.is_empty() {
            lines.push(String::new());
            lines.push("ERRORS".to_string());
            for error in &self.errors {
                lines.push(format!("  [x] {error}"));
            }
        }

        if !self.warnings.is_empty() {
            lines.push(String::new());
            lines.push("WARNINGS".to_string());
            for warning in &self.warnings {
                lines.push(format!("  [!] {warning}"));
            }
        }

        lines.push("=".repeat(60));
        lines.join("\n")
    }
}

/// Shared-ownership handle to a run's stats, safe to pass into worker pools.
pub type SharedStats = Arc<Mutex<PipelineStats>>;

#[must_use]
pub fn new_shared_stats() -> SharedStats {
    Arc::new(Mutex::new(PipelineStats::default()))
}

/// Runs `future`, recording its wall-clock duration as an operation timing.
pub async fn time_operation<F, T>(
    stats: &SharedStats,
    name: &str,
    stage: Option<&str>,
    details: Value,
    future: F,
) -> T
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let result = future.await;
    let elapsed = started.elapsed();
    stats
        .lock()
        .await
        .record_timing(name, elapsed, stage, details);
    result
}

/// Logs `report` line-by-line at `INFO`, matching the rest of the run's
/// structured logging rather than printing it separately.
pub fn log_summary_report(report: &str) {
    for line in report.lines() {
        info!("{line}");
    }
}

/// Formats a duration the way an operator reads it: `"12.3s"`, `"4m 5s"`, `"1h 2m"`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else if secs < 3600.0 {
        let minutes = (secs / 60.0).floor();
        let remaining = secs - minutes * 60.0;
        format!("{minutes:.0}m {remaining:.0}s")
    } else {
        let hours = (secs / 3600.0).floor();
        let minutes = ((secs - hours * 3600.0) / 60.0).floor();
        format!("{hours:.0}h {minutes:.0}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_seconds() {
        assert_eq!(format_duration(Duration::from_millis(1230)), "1.2s");
    }

    #[test]
    fn formats_minutes() {
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn formats_hours() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m");
    }

    #[test]
    fn slowest_operations_sorted_descending() {
        let mut stats = PipelineStats::default();
        stats.record_timing("a", Duration::from_secs(1), None, Value::Null);
        stats.record_timing("b", Duration::from_secs(5), None, Value::Null);
        stats.record_timing("c", Duration::from_secs(3), None, Value::Null);
        let slowest = stats.slowest_operations(2);
        assert_eq!(slowest[0].name, "b");
        assert_eq!(slowest[1].name, "c");
    }

    #[test]
    fn operation_summary_aggregates() {
        let mut stats = PipelineStats::default();
        stats.record_timing(OP_LLM_CALL, Duration::from_secs(1), None, Value::Null);
        stats.record_timing(OP_LLM_CALL, Duration::from_secs(3), None, Value::Null);
        let summary = stats.operation_summary(OP_LLM_CALL).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.total, Duration::from_secs(4));
        assert_eq!(summary.min, Duration::from_secs(1));
        assert_eq!(summary.max, Duration::from_secs(3));
    }
}
