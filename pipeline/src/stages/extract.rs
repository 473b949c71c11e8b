//! EXTRACT stage: documents.json → per-document markdown → external entity
//! and relation extraction.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use common::error::AppError;
use common::reporting::{time_operation, OP_LLM_CALL};
use serde_json::{json, Value};

use super::{StageContext, StageRunner};
use crate::state::Stage;
use crate::subprocess::run_with_timeout;

const TIMEOUT: Duration = Duration::from_secs(3600);

pub struct ExtractStageRunner;

#[async_trait]
impl StageRunner for ExtractStageRunner {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    fn validate_inputs(&self, ctx: &StageContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        match ctx.state.stage(Stage::Export).and_then(|s| s.outputs.get("documents_file")) {
            None => errors.push("export stage outputs not found".to_string()),
            Some(path) => {
                let path = path.as_str().unwrap_or_default();
                if !std::path::Path::new(path).exists() {
                    errors.push(format!("documents file not found: {path}"));
                }
            }
        }
        match &ctx.config.leanrag_dir {
            None => errors.push("extraction engine directory not configured".to_string()),
            Some(dir) if !dir.exists() => {
                errors.push(format!("extraction engine directory not found: {}", dir.display()));
            }
            Some(dir) => {
                if !dir.join("leanrag/pipelines/process.py").exists() {
                    errors.push("extraction pipeline script not found at leanrag/pipelines/process.py".to_string());
                }
            }
        }
        errors.extend(ctx.config.llm.validate());
        errors
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<BTreeMap<String, Value>, AppError> {
        let export_outputs = ctx
            .state
            .stage(Stage::Export)
            .ok_or_else(|| AppError::Internal("export stage state missing".to_string()))?;
        let documents_file = export_outputs
            .outputs
            .get("documents_file")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("documents_file output missing".to_string()))?;

        let extract_dir = ctx.config.work_dir.join("extract");
        let working_dir = extract_dir.join("kg_working");
        let md_dir = extract_dir.join("markdown");
        std::fs::create_dir_all(&working_dir)?;
        std::fs::create_dir_all(&md_dir)?;

        let documents: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(documents_file)?)?;
        write_markdown_documents(&documents, &md_dir)?;

        let leanrag_dir = ctx
            .config
            .leanrag_dir
            .as_ref()
            .ok_or_else(|| AppError::Config("extraction engine directory not configured".to_string()))?;
        let pipeline_script = leanrag_dir.join("leanrag/pipelines/process.py");

        let args = vec![
            pipeline_script.to_string_lossy().into_owned(),
            "--input-dir".to_string(),
            md_dir.to_string_lossy().into_owned(),
            "--output-dir".to_string(),
            extract_dir.to_string_lossy().into_owned(),
            "--working-dir".to_string(),
            working_dir.to_string_lossy().into_owned(),
            "--max-tokens".to_string(),
            ctx.config.max_tokens.to_string(),
            "--overlap-tokens".to_string(),
            ctx.config.overlap_tokens.to_string(),
        ];

        let env = extraction_env(ctx.config);

        let output = time_operation(
            ctx.stats,
            OP_LLM_CALL,
            Some("extract"),
            json!({"operation": "extraction"}),
            run_with_timeout("python3", &args, leanrag_dir, &env, TIMEOUT),
        )
        .await?;

        if !output.success() {
            return Err(AppError::Backend(format!(
                "extraction pipeline failed with code {:?}: {}",
                output.status_code, output.stderr
            )));
        }

        let entity_file = working_dir.join("entity.jsonl");
        let relation_file = working_dir.join("relation.jsonl");
        if !entity_file.exists() {
            return Err(AppError::Backend(format!(
                "entity file not created: {}",
                entity_file.display()
            )));
        }

        let entity_count = count_lines(&entity_file)?;
        let relation_count = if relation_file.exists() {
            count_lines(&relation_file)?
        } else {
            0
        };

        {
            let mut stats = ctx.stats.lock().await;
            stats.entities_extracted += u64::try_from(entity_count).unwrap_or(0);
            stats.relations_extracted += u64::try_from(relation_count).unwrap_or(0);
        }

        let mut outputs = BTreeMap::new();
        outputs.insert("working_dir".to_string(), json!(working_dir));
        outputs.insert("entity_file".to_string(), json!(entity_file));
        outputs.insert("relation_file".to_string(), json!(relation_file));
        outputs.insert("entity_count".to_string(), json!(entity_count));
        outputs.insert("relation_count".to_string(), json!(relation_count));
        Ok(outputs)
    }
}

fn extraction_env(config: &common::config::PipelineConfig) -> HashMap<String, String> {
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

fn write_markdown_documents(documents: &[Value], md_dir: &std::path::Path) -> Result<(), AppError> {
    let mut used_names = std::collections::HashSet::new();
    for doc in documents {
        let doc_id = doc.get("doc_id").and_then(|v| v.as_str()).unwrap_or("unnamed");
        let title = doc.get("title").and_then(|v| v.as_str()).unwrap_or("Untitled");
        let content = doc.get("content").and_then(|v| v.as_str()).unwrap_or("");
        let metadata = doc.get("metadata").cloned().unwrap_or(Value::Null);

        let md_content = format!(
            "# {title}\n\n**Thread:** {}\n**Agent:** {}\n**Role:** {}\n**Type:** {}\n**Timestamp:** {}\n\n---\n\n{content}",
            field_or(&metadata, "thread_id"),
            field_or(&metadata, "agent"),
            field_or(&metadata, "role"),
            field_or(&metadata, "entry_type"),
            field_or(&metadata, "timestamp"),
        );

        let safe_id = sanitize_filename(doc_id, &mut used_names);
        std::fs::write(md_dir.join(format!("{safe_id}.md")), md_content)?;
    }
    Ok(())
}

fn field_or(metadata: &Value, key: &str) -> String {
    metadata
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Sanitizes `doc_id` into a safe filename stem: alphanumerics/dash/
/// underscore only, leading underscores stripped, capped at 200 chars, and
/// disambiguated against `used_names` with a numeric suffix on collision.
fn sanitize_filename(doc_id: &str, used_names: &mut std::collections::HashSet<String>) -> String {
    let sanitized: String = doc_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let sanitized = sanitized.trim_start_matches('_');
    let sanitized: String = sanitized.chars().take(200).collect();
    let base = if sanitized.is_empty() { "unnamed".to_string() } else { sanitized };

    let mut candidate = base.clone();
    let mut counter = 0;
    while used_names.contains(&candidate) {
        counter += 1;
        candidate = format!("{base}_{counter}");
    }
    used_names.insert(candidate.clone());
    candidate
}

fn count_lines(path: &std::path::Path) -> Result<usize, AppError> {
    Ok(std::fs::read_to_string(path)?.lines().filter(|l| !l.trim().is_empty()).count())
}
