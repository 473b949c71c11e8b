//! Drives the four canonical stages in order, persisting durable state after
//! every transition and applying the `force`/`fresh`/`incremental` run flags.

use std::collections::HashSet;
use std::time::Instant;

use common::config::PipelineConfig;
use common::error::AppError;
use common::ids::new_run_id;
use common::reporting::{log_summary_report, new_shared_stats, SharedStats};

use crate::incremental::{detect_changes, incremental_state_path, IncrementalState};
use crate::logging::{format_plan, format_total_duration, stage_complete, stage_failed, stage_start};
use crate::state::{list_runs, load_or_create_state, state_path, PipelineState, Stage};
use crate::stages::{get_runner, StageContext};

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    stats: SharedStats,
}

impl PipelineOrchestrator {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stats: new_shared_stats(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    #[must_use]
    pub fn list_runs(&self) -> Vec<String> {
        list_runs(&self.config.work_dir)
    }

    /// Runs every canonical stage from the run's current position through
    /// `Build`, stopping at the first failure. `force` bypasses the
    /// dependency rule for already-completed stages (re-running them);
    /// `fresh` deletes the run's work directory before starting; `incremental`
    /// loads cached per-topic artifacts and skips reprocessing unchanged
    /// threads.
    pub async fn run_all(
        &self,
        run_id: Option<String>,
        force: bool,
        fresh: bool,
        incremental: bool,
    ) -> Result<PipelineState, AppError> {
        let run_id = run_id.unwrap_or_else(new_run_id);

        if fresh && self.config.work_dir.exists() {
            std::fs::remove_dir_all(&self.config.work_dir)?;
        }
        self.config.ensure_work_dir()?;

        let mut state = load_or_create_state(
            &self.config.work_dir,
            &run_id,
            &self.config.threads_dir,
            self.config.test_mode,
        )?;

        let incremental_state = if incremental {
            self.prepare_incremental_state()?
        } else {
            IncrementalState::default()
        };

        tracing::info!(run_id = %run_id, plan = %format_plan(&Stage::ORDERED), "pipeline run starting");

        let started = Instant::now();
        let mut last_error = None;

        for stage in Stage::ORDERED {
            match self.run_stage(stage, &mut state, &incremental_state, force).await {
                Ok(()) => {}
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            }
        }

        let total_elapsed = started.elapsed();
        let report = self.stats.lock().await.summary_report(total_elapsed);
        log_summary_report(&report);
        tracing::info!(
            run_id = %run_id,
            total_duration = %format_total_duration(total_elapsed),
            "pipeline run finished"
        );

        if let Some(err) = last_error {
            return Err(err);
        }
        Ok(state)
    }

    /// Runs a single stage, enforcing the dependency rule unless `force`.
    /// Writes durable state after every transition.
    pub async fn run_stage(
        &self,
        stage: Stage,
        state: &mut PipelineState,
        incremental_state: &IncrementalState,
        force: bool,
    ) -> Result<(), AppError> {
        let already_complete = state
            .stage(stage)
            .is_some_and(|s| s.status == crate::state::StageStatus::Completed);
        if already_complete && !force {
            state.stage_mut(stage).skip();
            self.save_state(state)?;
            tracing::info!(stage = %stage, "stage already completed, skipping");
            return Ok(());
        }

        if let Err(reason) = state.can_run_stage(stage, force) {
            return Err(AppError::Validation(format!(
                "cannot run stage '{stage}': {reason}"
            )));
        }

        let Some(runner) = get_runner(stage) else {
            return Err(AppError::Internal(format!("no runner for stage '{stage}'")));
        };

        let ctx = StageContext {
            config: &self.config,
            state,
            stats: &self.stats,
            incremental: incremental_state,
        };
        let validation_errors = runner.validate_inputs(&ctx);
        if !validation_errors.is_empty() {
            let message = validation_errors.join("; ");
            state.stage_mut(stage).fail(message.clone());
            self.save_state(state)?;
            return Err(AppError::Validation(message));
        }

        state.stage_mut(stage).start(0);
        self.save_state(state)?;
        let timer = stage_start(stage);

        let ctx = StageContext {
            config: &self.config,
            state,
            stats: &self.stats,
            incremental: incremental_state,
        };
        match runner.run(&ctx).await {
            Ok(outputs) => {
                state.stage_mut(stage).complete(outputs);
                self.save_state(state)?;
                stage_complete(stage, timer, state.stage(stage).map_or(0, |s| s.processed_items), 0, &self.stats)
                    .await;
                Ok(())
            }
            Err(err) => {
                state.stage_mut(stage).fail(err.to_string());
                self.save_state(state)?;
                stage_failed(stage, timer, &err.to_string(), &self.stats).await;
                Err(err)
            }
        }
    }

    fn save_state(&self, state: &mut PipelineState) -> Result<(), AppError> {
        let path = state_path(&self.config.work_dir, &state.run_id);
        state.save(&path)
    }

    /// Loads `IncrementalState`, classifies every topic as changed or
    /// cached, and prunes topics no longer present on disk.
    fn prepare_incremental_state(&self) -> Result<IncrementalState, AppError> {
        let path = incremental_state_path(&self.config.work_dir);
        let mut incremental_state = IncrementalState::load(&path)?;

        let threads_dir = if self.config.threads_dir.join(".watercooler").is_dir() {
            self.config.threads_dir.join(".watercooler")
        } else {
            self.config.threads_dir.clone()
        };
        let changes = detect_changes(&threads_dir, &incremental_state);
        let current_topics: HashSet<String> =
            changes.changed.iter().chain(changes.cached.iter()).cloned().collect();
        let removed = incremental_state.remove_deleted_topics(&current_topics);
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "removed deleted topics from incremental state");
        }
        tracing::info!(
            changed = changes.changed.len(),
            cached = changes.cached.len(),
            "incremental change detection complete"
        );
        Ok(incremental_state)
    }
}
