//! Orchestrates the export/extract/dedupe/build stages over a durable,
//! resumable run state.

pub mod incremental;
pub mod logging;
pub mod orchestrator;
pub mod stages;
pub mod state;
pub mod subprocess;

pub use orchestrator::PipelineOrchestrator;
pub use state::{PipelineState, Stage, StageState, StageStatus};
