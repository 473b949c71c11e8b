//! DEDUPE stage: entity/relation deduplication over EXTRACT's raw output.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use common::config::PipelineConfig;
use common::error::AppError;
use common::reporting::{time_operation, OP_LLM_CALL};
use serde_json::{json, Value};

use super::{StageContext, StageRunner};
use crate::state::Stage;
use crate::subprocess::run_with_timeout;

const TIMEOUT: Duration = Duration::from_secs(1800);

pub struct DedupeStageRunner;

#[async_trait]
impl StageRunner for DedupeStageRunner {
    fn stage(&self) -> Stage {
        Stage::Dedupe
    }

    fn validate_inputs(&self, ctx: &StageContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        match ctx.state.stage(Stage::Extract).and_then(|s| s.outputs.get("entity_file")) {
            None => errors.push("extract stage outputs not found".to_string()),
            Some(path) => {
                let path = path.as_str().unwrap_or_default();
                if !std::path::Path::new(path).exists() {
                    errors.push(format!("entity file not found: {path}"));
                }
            }
        }
        match &ctx.config.leanrag_dir {
            None => errors.push("extraction engine directory not configured".to_string()),
            Some(dir) if !dir.join("GraphExtraction").join("deal_triple.py").exists() => {
                errors.push("deduplication script not found".to_string());
            }
            Some(_) => {}
        }
        errors
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<BTreeMap<String, Value>, AppError> {
        let extract_outputs = ctx
            .state
            .stage(Stage::Extract)
            .ok_or_else(|| AppError::Internal("extract stage state missing".to_string()))?;
        let working_dir = extract_outputs
            .outputs
            .get("working_dir")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("working_dir output missing".to_string()))?;

        let processed_dir = ctx.config.work_dir.join("graph").join("processed");
        std::fs::create_dir_all(&processed_dir)?;

        let leanrag_dir = ctx
            .config
            .leanrag_dir
            .as_ref()
            .ok_or_else(|| AppError::Config("extraction engine directory not configured".to_string()))?;
        let script = leanrag_dir.join("GraphExtraction").join("deal_triple.py");

        let args = vec![
            script.to_string_lossy().into_owned(),
            "--working-dir".to_string(),
            working_dir.to_string(),
            "--output-path".to_string(),
            processed_dir.to_string_lossy().into_owned(),
        ];

        let env = dedupe_env(ctx.config);

        let output = time_operation(
            ctx.stats,
            OP_LLM_CALL,
            Some("dedupe"),
            json!({"operation": "entity_deduplication"}),
            run_with_timeout("python3", &args, leanrag_dir, &env, TIMEOUT),
        )
        .await?;

        if !output.success() {
            return Err(AppError::Backend(format!(
                "entity deduplication failed with code {:?}: {}",
                output.status_code, output.stderr
            )));
        }

        let entity_file = processed_dir.join("entity.jsonl");
        if !entity_file.exists() {
            return Err(AppError::Backend(format!(
                "processed entity file not created: {}",
                entity_file.display()
            )));
        }
        let relation_file = processed_dir.join("relation.jsonl");

        let entity_count = count_lines(&entity_file)?;
        let relation_count = if relation_file.exists() {
            count_lines(&relation_file)?
        } else {
            0
        };

        ctx.stats.lock().await.entities_deduplicated += u64::try_from(entity_count).unwrap_or(0);

        let mut outputs = BTreeMap::new();
        outputs.insert("processed_dir".to_string(), json!(processed_dir));
        outputs.insert("entity_file".to_string(), json!(entity_file));
        outputs.insert("relation_file".to_string(), json!(relation_file));
        outputs.insert("entity_count".to_string(), json!(entity_count));
        outputs.insert("relation_count".to_string(), json!(relation_count));
        Ok(outputs)
    }
}

fn dedupe_env(config: &PipelineConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(key) = &config.llm.api_key {
        env.insert("LLM_API_KEY".to_string(), key.clone());
    }
    env.insert("LLM_API_BASE".to_string(), config.llm.base_url.clone());
    env.insert("LLM_MODEL".to_string(), config.llm.model.clone());
    env.insert("EMBEDDING_MODEL".to_string(), config.embedding.model.clone());
    env.insert("EMBEDDING_API_BASE".to_string(), config.embedding.base_url.clone());
    env.insert(
        "EMBEDDING_BATCH_SIZE".to_string(),
        config.embedding.batch_size.to_string(),
    );
    env
}

fn count_lines(path: &std::path::Path) -> Result<usize, AppError> {
    Ok(std::fs::read_to_string(path)?.lines().filter(|l| !l.trim().is_empty()).count())
}
