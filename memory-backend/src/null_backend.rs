//! Reference adapter used for contract tests: echoes inputs back without any
//! real indexing or retrieval.

use std::sync::Mutex;

use async_trait::async_trait;
use common::error::AppError;
use serde_json::json;

use crate::types::{
    Capabilities, ChunkPayload, CorpusPayload, CoreResult, HealthStatus, IdKind, IndexResult,
    MemoryBackend, PrepareResult, QueryPayload, QueryResult, MANIFEST_VERSION,
};

#[derive(Default)]
struct State {
    corpus: Option<CorpusPayload>,
    chunks: Vec<common::model::ChunkNode>,
}

/// Echoes prepared corpora and indexed chunks back on query, one result
/// record per stored chunk regardless of the number of distinct queries
/// submitted.
pub struct NullBackend {
    state: Mutex<State>,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NullBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl MemoryBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    async fn prepare(&self, payload: CorpusPayload) -> Result<PrepareResult, AppError> {
        let count = payload.threads.len() + payload.entries.len();
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.corpus = Some(payload);
        Ok(PrepareResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            prepared_count: count,
            message: None,
        })
    }

    async fn index(&self, payload: ChunkPayload) -> Result<IndexResult, AppError> {
        let count = payload.chunks.len();
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.chunks = payload.chunks;
        Ok(IndexResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            indexed_count: count,
            message: None,
        })
    }

    async fn query(&self, payload: QueryPayload) -> Result<QueryResult, AppError> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        let queries: Vec<String> = payload.queries.iter().map(|q| q.query.clone()).collect();
        let results = state
            .chunks
            .iter()
            .map(|chunk| CoreResult {
                id: chunk.chunk_id.clone(),
                content: Some(chunk.text.clone()),
                backend: "null".to_string(),
                extra: [("query".to_string(), json!(queries))].into_iter().collect(),
                ..CoreResult::default()
            })
            .collect();
        Ok(QueryResult {
            manifest_version: MANIFEST_VERSION.to_string(),
            results,
        })
    }

    async fn healthcheck(&self) -> HealthStatus {
        HealthStatus {
            ok: true,
            details: None,
        }
    }

    fn get_capabilities(&self) -> Capabilities {
        Capabilities {
            embeddings: false,
            entity_extraction: false,
            graph_query: false,
            rerank: false,
            schema_versions: vec![MANIFEST_VERSION.to_string()],
            supports_falkor: false,
            supports_milvus: false,
            supports_neo4j: false,
            max_tokens: None,
            supports_nodes: false,
            supports_facts: false,
            supports_episodes: false,
            supports_chunks: false,
            supports_edges: false,
            node_id_type: IdKind::Passthrough,
            edge_id_type: IdKind::Passthrough,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryItem;
    use common::model::ChunkNode;

    fn chunk(id: &str) -> ChunkNode {
        ChunkNode {
            chunk_id: id.to_string(),
            entry_id: "e1".to_string(),
            thread_id: "t1".to_string(),
            index: 0,
            text: "hello".to_string(),
            token_count: 2,
            event_time: None,
            embedding: None,
        }
    }

    #[tokio::test]
    async fn query_returns_one_result_per_chunk_not_per_query() {
        let backend = NullBackend::new();
        backend
            .index(ChunkPayload {
                manifest_version: MANIFEST_VERSION.to_string(),
                chunks: vec![chunk("c1"), chunk("c2"), chunk("c3")],
                threads: None,
                entries: None,
                edges: None,
            })
            .await
            .unwrap();

        let result = backend
            .query(QueryPayload {
                manifest_version: MANIFEST_VERSION.to_string(),
                queries: vec![
                    QueryItem { query: "a".to_string(), limit: None },
                    QueryItem { query: "b".to_string(), limit: None },
                ],
            })
            .await
            .unwrap();

        assert_eq!(result.results.len(), 3);
    }

    #[tokio::test]
    async fn extended_ops_are_unsupported() {
        let backend = NullBackend::new();
        let err = backend.search_nodes("q", None, 5, None).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedOperation(_)));
    }
}
