//! Resumable run state: the four canonical stages, their per-stage status,
//! and the durable `<work_dir>/state/<run_id>.json` record that lets a
//! crashed run pick up where it left off.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use common::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four canonical pipeline stages plus the reserved, never-scheduled
/// `Query` stage (see the glossary entry for `Stage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Export,
    Extract,
    Dedupe,
    Build,
    Query,
}

impl Stage {
    /// The strict execution order of the stages `run_all` schedules.
    pub const ORDERED: [Stage; 4] = [Stage::Export, Stage::Extract, Stage::Dedupe, Stage::Build];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Export => "export",
            Stage::Extract => "extract",
            Stage::Dedupe => "dedupe",
            Stage::Build => "build",
            Stage::Query => "query",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Durable record of one stage's execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub total_items: usize,
    #[serde(default)]
    pub processed_items: usize,
    #[serde(default)]
    pub failed_items: usize,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            total_items: 0,
            processed_items: 0,
            failed_items: 0,
            outputs: BTreeMap::new(),
        }
    }
}

impl StageState {
    pub fn start(&mut self, total_items: usize) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now().to_rfc3339());
        self.total_items = total_items;
        self.processed_items = 0;
        self.failed_items = 0;
        self.error = None;
    }

    pub fn complete(&mut self, outputs: BTreeMap<String, Value>) {
        self.status = StageStatus::Completed;
        self.completed_at = Some(Utc::now().to_rfc3339());
        self.outputs = outputs;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StageStatus::Failed;
        self.completed_at = Some(Utc::now().to_rfc3339());
        self.error = Some(error.into());
    }

    pub fn skip(&mut self) {
        self.status = StageStatus::Skipped;
        self.completed_at = Some(Utc::now().to_rfc3339());
    }

    pub fn update_progress(&mut self, processed: usize, failed: usize) {
        self.processed_items = processed;
        self.failed_items = failed;
    }

    #[must_use]
    pub fn progress_pct(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        100.0 * self.processed_items as f64 / self.total_items as f64
    }
}

/// The full durable state of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub run_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub threads_dir: PathBuf,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub test_mode: bool,
    pub stages: BTreeMap<String, StageState>,
}

impl PipelineState {
    #[must_use]
    pub fn create(run_id: String, threads_dir: PathBuf, work_dir: PathBuf, test_mode: bool) -> Self {
        let now = Utc::now().to_rfc3339();
        let stages = Stage::ORDERED
            .iter()
            .map(|s| (s.as_str().to_string(), StageState::default()))
            .collect();
        Self {
            run_id,
            created_at: now.clone(),
            updated_at: now,
            threads_dir,
            work_dir,
            test_mode,
            stages,
        }
    }

    /// Gets (creating with `Pending` default if absent) the state for `stage`.
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageState {
        self.stages.entry(stage.as_str().to_string()).or_default()
    }

    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageState> {
        self.stages.get(stage.as_str())
    }

    /// All four canonical stages report `Completed`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        Stage::ORDERED.iter().all(|s| {
            self.stage(*s)
                .is_some_and(|st| st.status == StageStatus::Completed)
        })
    }

    /// The running or next-pending stage, in canonical order; `None` once
    /// every stage has completed.
    #[must_use]
    pub fn current_stage(&self) -> Option<Stage> {
        Stage::ORDERED.into_iter().find(|s| {
            self.stage(*s).map_or(true, |st| {
                matches!(st.status, StageStatus::Running | StageStatus::Pending)
            })
        })
    }

    /// Whether `stage` may run: every stage before it in canonical order
    /// must be `Completed`, unless `force` overrides the dependency rule.
    #[must_use]
    pub fn can_run_stage(&self, stage: Stage, force: bool) -> Result<(), String> {
        if force {
            return Ok(());
        }
        let Some(idx) = Stage::ORDERED.iter().position(|s| *s == stage) else {
            return Err(format!("stage '{stage}' is not schedulable"));
        };
        for prev in &Stage::ORDERED[..idx] {
            let status = self.stage(*prev).map_or(StageStatus::Pending, |s| s.status);
            if status != StageStatus::Completed {
                return Err(format!(
                    "previous stage '{prev}' not completed (status: {status:?})"
                ));
            }
        }
        Ok(())
    }

    /// Serializes to `path` via write-then-rename, touching `updated_at` first.
    pub fn save(&mut self, path: &Path) -> Result<(), AppError> {
        self.updated_at = Utc::now().to_rfc3339();
        let bytes = serde_json::to_vec_pretty(self)?;
        cache::atomic_write(path, &bytes)
    }

    /// Deserializes a previously saved state file. A corrupted or
    /// unreadable state file is a hard error here rather than a silent
    /// reset to a clean state — see the Open Questions resolution in
    /// `SPEC_FULL.md` §9: silent loss of a durability-critical file is
    /// judged worse than a visible failure the operator can investigate.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&raw)?;
        Ok(state)
    }
}

#[must_use]
pub fn state_path(work_dir: &Path, run_id: &str) -> PathBuf {
    work_dir.join("state").join(format!("{run_id}.json"))
}

/// Loads the state for `run_id` if a state file exists, else creates a fresh
/// one with all stages `Pending`.
pub fn load_or_create_state(
    work_dir: &Path,
    run_id: &str,
    threads_dir: &Path,
    test_mode: bool,
) -> Result<PipelineState, AppError> {
    let path = state_path(work_dir, run_id);
    if path.exists() {
        return PipelineState::load(&path);
    }
    Ok(PipelineState::create(
        run_id.to_string(),
        threads_dir.to_path_buf(),
        work_dir.to_path_buf(),
        test_mode,
    ))
}

/// Lists run IDs found under `<work_dir>/state`, most-recently-modified first.
#[must_use]
pub fn list_runs(work_dir: &Path) -> Vec<String> {
    let state_dir = work_dir.join("state");
    let Ok(entries) = std::fs::read_dir(&state_dir) else {
        return Vec::new();
    };
    let mut runs: Vec<(String, std::time::SystemTime)> = entries
        .flatten()
        .filter(|e| e.path().extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|e| {
            let stem = e.path().file_stem()?.to_str()?.to_string();
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((stem, modified))
        })
        .collect();
    runs.sort_by(|a, b| b.1.cmp(&a.1));
    runs.into_iter().map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_has_all_stages_pending() {
        let state = PipelineState::create(
            "01J".to_string(),
            PathBuf::from("threads"),
            PathBuf::from("work"),
            false,
        );
        for stage in Stage::ORDERED {
            assert_eq!(state.stage(stage).unwrap().status, StageStatus::Pending);
        }
        assert_eq!(state.current_stage(), Some(Stage::Export));
        assert!(!state.is_complete());
    }

    #[test]
    fn can_run_stage_enforces_dependency_order() {
        let mut state = PipelineState::create(
            "01J".to_string(),
            PathBuf::from("threads"),
            PathBuf::from("work"),
            false,
        );
        assert!(state.can_run_stage(Stage::Export, false).is_ok());
        assert!(state.can_run_stage(Stage::Extract, false).is_err());
        state.stage_mut(Stage::Export).complete(BTreeMap::new());
        assert!(state.can_run_stage(Stage::Extract, false).is_ok());
    }

    #[test]
    fn force_bypasses_dependency_rule() {
        let state = PipelineState::create(
            "01J".to_string(),
            PathBuf::from("threads"),
            PathBuf::from("work"),
            false,
        );
        assert!(state.can_run_stage(Stage::Build, true).is_ok());
        assert!(state.can_run_stage(Stage::Build, false).is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = PipelineState::create(
            "01J".to_string(),
            PathBuf::from("threads"),
            dir.path().to_path_buf(),
            true,
        );
        state.stage_mut(Stage::Export).start(3);
        state.stage_mut(Stage::Export).update_progress(3, 0);
        state
            .stage_mut(Stage::Export)
            .complete(BTreeMap::new());
        let path = state_path(dir.path(), &state.run_id);
        state.save(&path).unwrap();

        let loaded = PipelineState::load(&path).unwrap();
        assert_eq!(loaded.stage(Stage::Export).unwrap().status, StageStatus::Completed);
        assert!(loaded.test_mode);
    }

    #[test]
    fn load_corrupted_state_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not valid json").unwrap();
        assert!(PipelineState::load(&path).is_err());
    }

    #[test]
    fn is_complete_requires_all_four_stages() {
        let mut state = PipelineState::create(
            "01J".to_string(),
            PathBuf::from("threads"),
            PathBuf::from("work"),
            false,
        );
        for stage in Stage::ORDERED {
            assert!(!state.is_complete());
            state.stage_mut(stage).complete(BTreeMap::new());
        }
        assert!(state.is_complete());
        assert_eq!(state.current_stage(), None);
    }
}
