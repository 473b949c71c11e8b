//! Adapter for an external hierarchical-cluster knowledge-graph engine
//! (entries -> documents -> extracted entities organized into a hierarchy of
//! clusters, queried by vector similarity and hierarchical-path traversal).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use common::error::AppError;
use common::model::ChunkNode;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;

use crate::types::{
    validate_edge_id, validate_node_id, Capabilities, ChunkPayload, CorpusPayload, CoreResult,
    HealthStatus, IdKind, IndexResult, MemoryBackend, PrepareResult, QueryPayload, QueryResult,
    MANIFEST_VERSION,
};

const INDEX_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Serializes the process-wide working-directory changes an embedded
/// library forces on this adapter's subprocess invocation path.
fn cwd_mutex() -> &'static Mutex<()> {
    static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
    MUTEX.get_or_init(|| Mutex::new(()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityRecord {
    name: String,
    embedding: Vec<f32>,
    parent: Option<String>,
}

struct IndexedState {
    entities: Vec<EntityRecord>,
    ancestors: HashMap<String, Vec<String>>,
}

/// Adapter backed by an external engine rooted at `engine_dir`, invoked via
/// its entrypoint script for entity/relation extraction and graph building.
pub struct HierarchicalClusterBackend {
    engine_dir: PathBuf,
    entrypoint: PathBuf,
    work_dir: PathBuf,
    state: Mutex<IndexedState>,
}

impl HierarchicalClusterBackend {
    /// Constructs the adapter from `LEANRAG_DIR` / `WC_PIPELINE_WORK_DIR`.
    /// Fails with `ConfigError` if the engine directory or its entrypoint
    /// script does not exist.
    pub fn from_env() -> Result<Self, AppError> {
        let engine_dir = PathBuf::from(
            std::env::var("LEANRAG_DIR")
                .map_err(|_| AppError::Config("LEANRAG_DIR is not set".to_string()))?,
        );
        let work_dir = std::env::var("WC_PIPELINE_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("watercooler-leanrag"));
        Self::new(engine_dir, work_dir)
    }

    pub fn new(engine_dir: PathBuf, work_dir: PathBuf) -> Result<Self, AppError> {
        if !engine_dir.is_dir() {
            return Err(AppError::Config(format!(
                "leanrag engine directory does not exist: {}",
                engine_dir.display()
            )));
        }
        let entrypoint = engine_dir.join("main.py");
        if !entrypoint.is_file() {
            return Err(AppError::Config(format!(
                "leanrag entrypoint script not found: {}",
                entrypoint.display()
            )));
        }
        Ok(Self {
            engine_dir,
            entrypoint,
            work_dir,
            state: Mutex::new(IndexedState {
                entities: Vec::new(),
                ancestors: HashMap::new(),
            }),
        })
    }

    fn chunk_hash(chunk: &ChunkNode) -> String {
        let digest = Md5::digest(chunk.text.as_bytes());
        format!("{digest:x}")
    }
}

#[async_trait]
impl MemoryBackend for HierarchicalClusterBackend {
    fn name(&self) -> &str {
        "leanrag"
    }

    async fn prepare(&self, payload: CorpusPayload) -> Result<PrepareResult, AppError> {
        std::fs::create_dir_all(&self.work_dir)?;
        let documents: Vec<_> = payload
            .entries
            .iter()
            .map(|e| json!({"id": e.entry_id, "thread_id": e.thread_id, "text": e.body}))
            .collect();

        cache::atomic_write(
            &self.work_dir.join("documents.json"),
            serde_json::to_vec_pretty(&documents)?.as_slice(),
        )?;
        cache::atomic_write(
            &self.work_dir.join("threads.json"),
            serde_json::to_vec_pretty(&payload.threads)?.as_slice(),
        )?;
        cache::atomic_write(
            &self.work_dir.join("manifest.json"),
            serde_json::to_vec_pretty(&json!({"manifest_version": MANIFEST_VERSION}))?.as_slice(),
        )?;

        Ok(PrepareResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            prepared_count: payload.entries.len(),
            message: None,
        })
    }

    async fn index(&self, payload: ChunkPayload) -> Result<IndexResult, AppError> {
        let chunk_records: Vec<_> = payload
            .chunks
            .iter()
            .map(|c| json!({"hash_id": Self::chunk_hash(c), "text": c.text}))
            .collect();
        cache::atomic_write(
            &self.work_dir.join("threads_chunk.json"),
            serde_json::to_vec_pretty(&chunk_records)?.as_slice(),
        )?;

        let _cwd_guard = cwd_mutex().lock().map_err(|_| {
            AppError::Internal("working-directory mutex poisoned".to_string())
        })?;

        let spawn = Command::new("python3")
            .arg(&self.entrypoint)
            .arg("--work-dir")
            .arg(&self.work_dir)
            .current_dir(&self.engine_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawn {
            Ok(child) => child,
            Err(err) => return Err(AppError::Backend(format!("failed to spawn leanrag engine: {err}"))),
        };

        let status = tokio::time::timeout(INDEX_TIMEOUT, child.wait())
            .await
            .map_err(|_| AppError::Transient("leanrag indexing timed out".to_string()))?
            .map_err(|e| AppError::Backend(format!("leanrag engine process error: {e}")))?;

        if !status.success() {
            return Err(AppError::Backend(format!(
                "leanrag engine exited with status {status}"
            )));
        }

        let entities_path = self.work_dir.join("entities.json");
        if !entities_path.is_file() {
            return Err(AppError::Config(
                "leanrag engine did not produce entities.json".to_string(),
            ));
        }
        let raw = std::fs::read_to_string(&entities_path)?;
        let entities: Vec<EntityRecord> = serde_json::from_str(&raw)?;
        let mut ancestors = HashMap::new();
        for entity in &entities {
            if let Some(parent) = &entity.parent {
                ancestors
                    .entry(entity.name.clone())
                    .or_insert_with(Vec::new)
                    .push(parent.clone());
            }
        }

        let indexed_count = entities.len();
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.entities = entities;
        state.ancestors = ancestors;

        Ok(IndexResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            indexed_count,
            message: None,
        })
    }

    async fn query(&self, payload: QueryPayload) -> Result<QueryResult, AppError> {
        let mut results = Vec::new();
        for item in &payload.queries {
            let max_results = item.limit.unwrap_or(10);
            results.extend(
                self.search_nodes(&item.query, None, max_results, None)
                    .await?,
            );
        }
        Ok(QueryResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            results,
        })
    }

    async fn healthcheck(&self) -> HealthStatus {
        HealthStatus {
            ok: self.engine_dir.is_dir() && self.entrypoint.is_file(),
            details: None,
        }
    }

    fn get_capabilities(&self) -> Capabilities {
        Capabilities {
            embeddings: true,
            entity_extraction: true,
            graph_query: true,
            rerank: false,
            schema_versions: vec![MANIFEST_VERSION.to_string()],
            supports_falkor: true,
            supports_milvus: false,
            supports_neo4j: false,
            max_tokens: None,
            supports_nodes: true,
            supports_facts: true,
            supports_episodes: false,
            supports_chunks: true,
            supports_edges: true,
            node_id_type: IdKind::Name,
            edge_id_type: IdKind::Synthetic,
        }
    }

    async fn search_nodes(
        &self,
        query: &str,
        _group_ids: Option<&[String]>,
        max_results: usize,
        _entity_types: Option<&[String]>,
    ) -> Result<Vec<CoreResult>, AppError> {
        // A real implementation would embed `query`; this scores by simple
        // substring relevance since no embedding client is threaded through
        // the backend trait.
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        let query_lower = query.to_lowercase();
        let mut scored: Vec<(f64, &EntityRecord)> = state
            .entities
            .iter()
            .map(|e| {
                let score = if e.name.to_lowercase().contains(&query_lower) {
                    1.0
                } else {
                    0.0
                };
                (score, e)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(max_results)
            .map(|(score, entity)| {
                let normalized = entity.name.trim().trim_matches('"').trim_matches('\'');
                CoreResult {
                    id: normalized.to_string(),
                    name: Some(normalized.to_string()),
                    score: Some(score),
                    backend: self.name().to_string(),
                    metadata: [(
                        "parent".to_string(),
                        json!(entity.parent.clone().unwrap_or_default()),
                    )]
                    .into_iter()
                    .collect(),
                    ..CoreResult::default()
                }
            })
            .collect())
    }

    async fn search_facts(
        &self,
        query: &str,
        group_ids: Option<&[String]>,
        max_results: usize,
        _center_node_id: Option<&str>,
    ) -> Result<Vec<CoreResult>, AppError> {
        let node_results = self
            .search_nodes(query, group_ids, max_results.saturating_mul(2), None)
            .await?;

        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        let max_paths = max_results.max(10);
        let mut seen_pairs: HashSet<(String, String)> = HashSet::new();
        let mut facts = Vec::new();

        'outer: for a in &node_results {
            for b in &node_results {
                if a.id == b.id {
                    continue;
                }
                let key = if a.id < b.id {
                    (a.id.clone(), b.id.clone())
                } else {
                    (b.id.clone(), a.id.clone())
                };
                if !seen_pairs.insert(key) {
                    continue;
                }
                if seen_pairs.len() > max_paths * 20 {
                    break 'outer;
                }

                let a_ancestors = state.ancestors.get(&a.id);
                let b_ancestors = state.ancestors.get(&b.id);
                let shares_ancestor = match (a_ancestors, b_ancestors) {
                    (Some(ax), Some(bx)) => ax.iter().any(|p| bx.contains(p)),
                    _ => false,
                };
                if shares_ancestor {
                    facts.push(CoreResult {
                        id: format!("{}||{}", a.id, b.id),
                        source_node_id: Some(a.id.clone()),
                        target_node_id: Some(b.id.clone()),
                        score: Some(a.score.unwrap_or(0.0).max(b.score.unwrap_or(0.0))),
                        backend: self.name().to_string(),
                        ..CoreResult::default()
                    });
                }
                if facts.len() >= max_results.saturating_mul(3) {
                    break 'outer;
                }
            }
        }

        facts.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .partial_cmp(&a.score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        facts.truncate(max_results);
        Ok(facts)
    }

    async fn search_episodes(
        &self,
        _query: &str,
        _group_ids: Option<&[String]>,
        _max_results: usize,
    ) -> Result<Vec<CoreResult>, AppError> {
        Err(AppError::UnsupportedOperation(
            "search_episodes is not supported by backend 'leanrag': hierarchical-cluster chunks carry no episode provenance".to_string(),
        ))
    }

    async fn get_node(
        &self,
        node_id: &str,
        _group_id: Option<&str>,
    ) -> Result<Option<CoreResult>, AppError> {
        validate_node_id(IdKind::Name, node_id)?;
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        Ok(state
            .entities
            .iter()
            .find(|e| e.name == node_id)
            .map(|e| CoreResult {
                id: e.name.clone(),
                name: Some(e.name.clone()),
                backend: self.name().to_string(),
                ..CoreResult::default()
            }))
    }

    async fn get_edge(
        &self,
        edge_id: &str,
        _group_id: Option<&str>,
    ) -> Result<Option<CoreResult>, AppError> {
        validate_edge_id(IdKind::Synthetic, edge_id)?;
        let Some((source, target)) = edge_id.split_once("||") else {
            return Ok(None);
        };
        Ok(Some(CoreResult {
            id: edge_id.to_string(),
            source_node_id: Some(source.to_string()),
            target_node_id: Some(target.to_string()),
            backend: self.name().to_string(),
            ..CoreResult::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_backend() -> (tempfile::TempDir, HierarchicalClusterBackend) {
        let dir = tempfile::tempdir().unwrap();
        let engine_dir = dir.path().join("engine");
        std::fs::create_dir_all(&engine_dir).unwrap();
        std::fs::write(engine_dir.join("main.py"), "# stub").unwrap();
        let work_dir = dir.path().join("work");
        let backend = HierarchicalClusterBackend::new(engine_dir, work_dir).unwrap();
        (dir, backend)
    }

    #[test]
    fn construction_fails_without_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        let result = HierarchicalClusterBackend::new(dir.path().to_path_buf(), dir.path().to_path_buf());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn get_node_rejects_uuid_shaped_ids() {
        let (_dir, backend) = make_backend();
        let err = backend
            .get_node("550e8400-e29b-41d4-a716-446655440000", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::IdNotSupported(_)));
    }

    #[tokio::test]
    async fn get_edge_rejects_malformed_synthetic_ids() {
        let (_dir, backend) = make_backend();
        let err = backend.get_edge("not-a-pair", None).await.unwrap_err();
        assert!(matches!(err, AppError::IdNotSupported(_)));
    }

    #[tokio::test]
    async fn search_episodes_is_unsupported() {
        let (_dir, backend) = make_backend();
        let err = backend.search_episodes("q", None, 5).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedOperation(_)));
    }
}
