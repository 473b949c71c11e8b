//! EXPORT stage: threads on disk → a fully materialized graph → canonical
//! export payloads consumed by EXTRACT.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cache::{EmbeddingCache, SummaryCache, ThreadSummaryCache};
use common::error::AppError;
use common::reporting::{time_operation, OP_FILE_WRITE};
use graph::builder::GraphBuilder;
use graph::llm::{EmbeddingClient, LlmClient};
use memory_backend::types::CorpusPayload;
use memory_backend::types::MANIFEST_VERSION;
use serde_json::{json, Value};

use super::{StageContext, StageRunner};
use crate::incremental::{file_mtime_secs, incremental_state_path, IncrementalState};
use crate::state::Stage;

pub struct ExportStageRunner;

fn resolve_threads_dir(configured: &Path) -> PathBuf {
    let nested = configured.join(".watercooler");
    if nested.is_dir() {
        nested
    } else {
        configured.to_path_buf()
    }
}

#[async_trait]
impl StageRunner for ExportStageRunner {
    fn stage(&self) -> Stage {
        Stage::Export
    }

    fn validate_inputs(&self, ctx: &StageContext<'_>) -> Vec<String> {
        let mut errors = Vec::new();
        let threads_dir = resolve_threads_dir(&ctx.config.threads_dir);
        if !threads_dir.exists() {
            errors.push(format!(
                "threads directory not found: {}",
                threads_dir.display()
            ));
        } else {
            let has_md = std::fs::read_dir(&threads_dir)
                .map(|mut entries| {
                    entries.any(|e| {
                        e.ok()
                            .is_some_and(|e| e.path().extension().and_then(|x| x.to_str()) == Some("md"))
                    })
                })
                .unwrap_or(false);
            if !has_md {
                errors.push(format!("no .md files found in {}", threads_dir.display()));
            }
        }
        errors
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<BTreeMap<String, Value>, AppError> {
        let threads_dir = resolve_threads_dir(&ctx.config.threads_dir);

        let chunker_config = chunker::ChunkerConfig {
            max_tokens: ctx.config.max_tokens,
            overlap: ctx.config.overlap_tokens,
            ..chunker::ChunkerConfig::default()
        };

        let mut builder = GraphBuilder::new();
        builder.build(&threads_dir, None, &chunker_config, None);

        apply_cached_artifacts(&mut builder, &threads_dir, ctx.incremental);

        let summary_cache = SummaryCache::new(ctx.config.work_dir.join("cache").join("summaries"))?;
        let thread_summary_cache =
            ThreadSummaryCache::new(ctx.config.work_dir.join("cache").join("thread_summaries"))?;
        let embedding_cache = EmbeddingCache::new(ctx.config.work_dir.join("cache").join("embeddings"))?;
        let llm = LlmClient::new(&ctx.config.llm);
        let embedding_client = EmbeddingClient::new(&ctx.config.embedding);

        let mut warnings = Vec::new();
        builder
            .generate_summaries(&summary_cache, &thread_summary_cache, &llm, &mut warnings)
            .await;
        builder
            .generate_embeddings(
                &embedding_cache,
                &embedding_client,
                ctx.config.embedding.batch_size,
                ctx.config.max_concurrent,
                &mut warnings,
            )
            .await;
        for warning in &warnings {
            ctx.stats.lock().await.record_warning(warning.clone());
        }

        if ctx.config.test_mode {
            apply_test_limit(&mut builder, ctx.config.test_limit);
        }

        let export_dir = ctx.config.work_dir.join("export");
        std::fs::create_dir_all(&export_dir)?;

        let documents = build_documents(&builder);
        let manifest = json!({
            "manifest_version": MANIFEST_VERSION,
            "statistics": {
                "documents": documents.len(),
                "threads": builder.graph.threads.len(),
                "entries": builder.graph.entries.len(),
                "chunks": builder.graph.chunks.len(),
            },
        });

        let corpus = CorpusPayload {
            manifest_version: MANIFEST_VERSION.to_string(),
            threads: builder.graph.threads.values().cloned().collect(),
            entries: builder.graph.entries.values().cloned().collect(),
            edges: builder.graph.edges.clone(),
            chunker_descriptor: None,
        };

        let documents_file = export_dir.join("documents.json");
        let threads_file = export_dir.join("threads.json");
        let manifest_file = export_dir.join("manifest.json");

        time_operation(ctx.stats, OP_FILE_WRITE, Some("export"), Value::Null, async {
            cache::atomic_write(&documents_file, &serde_json::to_vec_pretty(&documents)?)?;
            cache::atomic_write(&threads_file, &serde_json::to_vec_pretty(&corpus)?)?;
            cache::atomic_write(&manifest_file, &serde_json::to_vec_pretty(&manifest)?)?;
            Ok::<(), AppError>(())
        })
        .await?;

        {
            let mut stats = ctx.stats.lock().await;
            stats.threads_processed += u64::try_from(builder.graph.threads.len()).unwrap_or(0);
            stats.entries_processed += u64::try_from(builder.graph.entries.len()).unwrap_or(0);
            stats.chunks_created += u64::try_from(builder.graph.chunks.len()).unwrap_or(0);
            stats.documents_exported += u64::try_from(documents.len()).unwrap_or(0);
        }

        save_incremental_state(&builder, &threads_dir, ctx.config.work_dir.as_path())?;

        let mut outputs = BTreeMap::new();
        outputs.insert("export_dir".to_string(), json!(export_dir));
        outputs.insert("documents_file".to_string(), json!(documents_file));
        outputs.insert("threads_file".to_string(), json!(threads_file));
        outputs.insert("manifest_file".to_string(), json!(manifest_file));
        outputs.insert("document_count".to_string(), json!(documents.len()));
        Ok(outputs)
    }
}

/// Applies cached summaries and embeddings onto threads/entries the
/// incremental-state scan found unchanged, so `generate_summaries`/
/// `generate_embeddings` skip re-deriving them.
fn apply_cached_artifacts(builder: &mut GraphBuilder, threads_dir: &Path, incremental: &IncrementalState) {
    let topics: Vec<String> = builder.graph.threads.keys().cloned().collect();
    for topic in topics {
        let entry_count = builder
            .graph
            .threads
            .get(&topic)
            .map_or(0, |t| t.entry_ids.len());
        let mtime = file_mtime_secs(&threads_dir.join(format!("{topic}.md")));
        if incremental.is_topic_changed(&topic, mtime, entry_count) {
            continue;
        }
        if let Some(summary) = incremental.cached_summary(&topic) {
            if let Some(thread) = builder.graph.threads.get_mut(&topic) {
                thread.summary = Some(summary);
            }
        }
        let entry_ids = builder
            .graph
            .threads
            .get(&topic)
            .map(|t| t.entry_ids.clone())
            .unwrap_or_default();
        for entry_id in entry_ids {
            if let Some(summary) = incremental.cached_entry_summary(&topic, &entry_id) {
                if let Some(entry) = builder.graph.entries.get_mut(&entry_id) {
                    entry.summary = Some(summary);
                }
            }
            if let Some(embedding) = incremental.cached_entry_embedding(&topic, &entry_id) {
                if let Some(entry) = builder.graph.entries.get_mut(&entry_id) {
                    entry.embedding = Some(embedding);
                }
            }
        }
    }
}

/// Refreshes `state.json` with the now-current mtime/entry_count/summary
/// artifacts for every topic, so the next incremental run can skip
/// unchanged threads.
fn save_incremental_state(
    builder: &GraphBuilder,
    threads_dir: &Path,
    work_dir: &Path,
) -> Result<(), AppError> {
    let path = incremental_state_path(work_dir);
    let mut state = IncrementalState::load(&path)?;

    for thread in builder.graph.threads.values() {
        let mtime = file_mtime_secs(&threads_dir.join(format!("{}.md", thread.thread_id)));
        let mut entry_summaries = std::collections::HashMap::new();
        let mut entry_embeddings = std::collections::HashMap::new();
        for entry_id in &thread.entry_ids {
            let Some(entry) = builder.graph.entries.get(entry_id) else {
                continue;
            };
            if let Some(summary) = &entry.summary {
                entry_summaries.insert(entry_id.clone(), summary.clone());
            }
            if let Some(embedding) = &entry.embedding {
                entry_embeddings.insert(entry_id.clone(), embedding.clone());
            }
        }
        state.update_topic(
            thread.thread_id.clone(),
            mtime,
            thread.entry_ids.len(),
            thread.summary.clone().unwrap_or_default(),
            entry_summaries,
            entry_embeddings,
        );
    }

    state.save(&path)
}

/// One entry becomes one exported document; chunks are derivable downstream
/// from the same entry body so are not separately exported here.
fn build_documents(builder: &GraphBuilder) -> Vec<Value> {
    let mut entries: Vec<_> = builder.graph.entries.values().collect();
    entries.sort_by_key(|e| (e.thread_id.clone(), e.sequence_index));

    entries
        .iter()
        .map(|entry| {
            let thread = builder.graph.threads.get(&entry.thread_id);
            json!({
                "doc_id": entry.entry_id,
                "title": entry.title.clone().unwrap_or_else(|| thread.map(|t| t.title.clone()).unwrap_or_default()),
                "content": entry.body,
                "metadata": {
                    "thread_id": entry.thread_id,
                    "agent": entry.agent,
                    "role": entry.role,
                    "entry_type": entry.entry_type,
                    "timestamp": entry.timestamp,
                },
            })
        })
        .collect()
}

/// Truncates the graph to `limit` threads (and their entries/chunks),
/// matching the source pipeline's test-mode behavior exactly.
fn apply_test_limit(builder: &mut GraphBuilder, limit: usize) {
    if builder.graph.threads.len() <= limit {
        return;
    }
    let keep: std::collections::HashSet<String> =
        builder.graph.threads.keys().take(limit).cloned().collect();
    builder.graph.threads.retain(|id, _| keep.contains(id));
    builder
        .graph
        .entries
        .retain(|_, entry| keep.contains(&entry.thread_id));
    let kept_entry_ids: std::collections::HashSet<String> =
        builder.graph.entries.keys().cloned().collect();
    builder.graph.chunks.retain(|_, chunk| kept_entry_ids.contains(&chunk.entry_id));
    builder.graph.edges.retain(|edge| {
        keep.contains(&edge.source_id)
            || kept_entry_ids.contains(&edge.source_id)
            || kept_entry_ids.contains(&edge.target_id)
    });
    builder.graph.hyperedges.retain(|h| keep.contains(&h.thread_id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PipelineState;
    use common::config::{EmbeddingConfig, LlmConfig, PipelineConfig};
    use common::reporting::new_shared_stats;

    fn test_config(threads_dir: PathBuf, work_dir: PathBuf) -> PipelineConfig {
        PipelineConfig {
            threads_dir,
            work_dir,
            leanrag_dir: None,
            graphiti_dir: None,
            batch_size: 10,
            max_concurrent: 4,
            max_tokens: 1024,
            overlap_tokens: 128,
            llm: LlmConfig {
                api_key: Some("test".to_string()),
                model: "test-model".to_string(),
                base_url: "http://127.0.0.1:1".to_string(),
            },
            embedding: EmbeddingConfig {
                api_key: Some("test".to_string()),
                model: "test-model".to_string(),
                base_url: "http://127.0.0.1:1".to_string(),
                embedding_dim: 4,
                batch_size: 8,
            },
            test_mode: false,
            test_limit: 5,
            memory_backend: None,
        }
    }

    #[tokio::test]
    async fn run_writes_export_artifacts_and_degrades_summaries_on_unreachable_llm() {
        let threads_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            threads_dir.path().join("alpha.md"),
            "Title: Alpha\nStatus: OPEN\nBall: alice\nUpdated: 2026-01-01T00:00:00Z\n\nEntry: alice 2026-01-01T00:00:00Z\nDiscussed rollout plans for the release.\n",
        )
        .unwrap();

        let config = test_config(threads_dir.path().to_path_buf(), work_dir.path().to_path_buf());
        let state = PipelineState::create(
            "run1".to_string(),
            config.threads_dir.clone(),
            config.work_dir.clone(),
            false,
        );
        let stats = new_shared_stats();
        let incremental = IncrementalState::default();
        let ctx = StageContext {
            config: &config,
            state: &state,
            stats: &stats,
            incremental: &incremental,
        };

        let runner = ExportStageRunner;
        assert!(runner.validate_inputs(&ctx).is_empty());

        let outputs = runner.run(&ctx).await.unwrap();
        let documents_file = outputs["documents_file"].as_str().unwrap();
        assert!(Path::new(documents_file).exists());

        let documents: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(documents_file).unwrap()).unwrap();
        assert_eq!(documents.len(), 1);

        let stats = stats.lock().await;
        assert_eq!(stats.threads_processed, 1);
        assert_eq!(stats.entries_processed, 1);
    }

    #[test]
    fn validate_inputs_reports_missing_threads_dir() {
        let work_dir = tempfile::tempdir().unwrap();
        let config = test_config(PathBuf::from("/nonexistent/threads"), work_dir.path().to_path_buf());
        let state = PipelineState::create(
            "run1".to_string(),
            config.threads_dir.clone(),
            config.work_dir.clone(),
            false,
        );
        let stats = new_shared_stats();
        let incremental = IncrementalState::default();
        let ctx = StageContext {
            config: &config,
            state: &state,
            stats: &stats,
            incremental: &incremental,
        };
        let errors = ExportStageRunner.validate_inputs(&ctx);
        assert!(!errors.is_empty());
    }
}
