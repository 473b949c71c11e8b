//! Stage runner contract and per-run execution context shared by the four
//! canonical stages.

pub mod build;
pub mod dedupe;
pub mod export;
pub mod extract;

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::config::PipelineConfig;
use common::error::AppError;
use common::reporting::SharedStats;
use serde_json::Value;

use crate::incremental::IncrementalState;
use crate::state::{PipelineState, Stage};

/// Everything a stage runner needs: configuration, the run's durable state
/// (read-only from the runner's point of view — the orchestrator alone
/// writes it back), shared stats, and the incremental cache.
pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub state: &'a PipelineState,
    pub stats: &'a SharedStats,
    pub incremental: &'a IncrementalState,
}

/// A single pipeline stage: validates its own inputs, then executes,
/// returning an opaque outputs map attached to `StageState.outputs`.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    /// Reasons the stage cannot run, given the current state and config.
    /// Pure — never touches the filesystem beyond existence checks.
    fn validate_inputs(&self, ctx: &StageContext<'_>) -> Vec<String>;

    async fn run(&self, ctx: &StageContext<'_>) -> Result<BTreeMap<String, Value>, AppError>;
}

/// Resolves the runner for `stage`. `Stage::Query` has no runner — it is
/// reserved and never scheduled by `run_all`.
#[must_use]
pub fn get_runner(stage: Stage) -> Option<Box<dyn StageRunner>> {
    match stage {
        Stage::Export => Some(Box::new(export::ExportStageRunner)),
        Stage::Extract => Some(Box::new(extract::ExtractStageRunner)),
        Stage::Dedupe => Some(Box::new(dedupe::DedupeStageRunner)),
        Stage::Build => Some(Box::new(build::BuildStageRunner)),
        Stage::Query => None,
    }
}
