//! The storage-agnostic contract every memory backend implements.

use std::collections::HashMap;

use async_trait::async_trait;
use common::error::AppError;
use common::model::{ChunkNode, Edge, EntryNode, ThreadNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MANIFEST_VERSION: &str = "1.0.0";

/// An ID-modality tag a backend declares for nodes/edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    Name,
    Uuid,
    Synthetic,
    Passthrough,
}

/// Declared feature set of a backend. All fields are first-class — never
/// bolted on after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub embeddings: bool,
    pub entity_extraction: bool,
    pub graph_query: bool,
    pub rerank: bool,
    pub schema_versions: Vec<String>,
    pub supports_falkor: bool,
    pub supports_milvus: bool,
    pub supports_neo4j: bool,
    pub max_tokens: Option<usize>,
    pub supports_nodes: bool,
    pub supports_facts: bool,
    pub supports_episodes: bool,
    pub supports_chunks: bool,
    pub supports_edges: bool,
    pub node_id_type: IdKind,
    pub edge_id_type: IdKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusPayload {
    pub manifest_version: String,
    pub threads: Vec<ThreadNode>,
    pub entries: Vec<EntryNode>,
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunker_descriptor: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub manifest_version: String,
    pub chunks: Vec<ChunkNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<Vec<ThreadNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<Edge>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryItem {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPayload {
    pub manifest_version: String,
    pub queries: Vec<QueryItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub backend: String,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResult {
    pub manifest_version: String,
    pub prepared_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResult {
    pub manifest_version: String,
    pub indexed_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub manifest_version: String,
    pub results: Vec<CoreResult>,
}

fn unsupported(operation: &str, backend: &str) -> AppError {
    AppError::UnsupportedOperation(format!("{operation} is not supported by backend '{backend}'"))
}

/// The storage-agnostic contract every memory backend implements. The five
/// core operations are required; the five extended retrieval operations
/// default to `UnsupportedOperationError` for backends that feature-detect
/// via `get_capabilities()`.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn prepare(&self, payload: CorpusPayload) -> Result<PrepareResult, AppError>;
    async fn index(&self, payload: ChunkPayload) -> Result<IndexResult, AppError>;
    async fn query(&self, payload: QueryPayload) -> Result<QueryResult, AppError>;
    async fn healthcheck(&self) -> HealthStatus;
    fn get_capabilities(&self) -> Capabilities;

    async fn search_nodes(
        &self,
        _query: &str,
        _group_ids: Option<&[String]>,
        _max_results: usize,
        _entity_types: Option<&[String]>,
    ) -> Result<Vec<CoreResult>, AppError> {
        Err(unsupported("search_nodes", self.name()))
    }

    async fn search_facts(
        &self,
        _query: &str,
        _group_ids: Option<&[String]>,
        _max_results: usize,
        _center_node_id: Option<&str>,
    ) -> Result<Vec<CoreResult>, AppError> {
        Err(unsupported("search_facts", self.name()))
    }

    async fn search_episodes(
        &self,
        _query: &str,
        _group_ids: Option<&[String]>,
        _max_results: usize,
    ) -> Result<Vec<CoreResult>, AppError> {
        Err(unsupported("search_episodes", self.name()))
    }

    async fn get_node(
        &self,
        _node_id: &str,
        _group_id: Option<&str>,
    ) -> Result<Option<CoreResult>, AppError> {
        Err(unsupported("get_node", self.name()))
    }

    async fn get_edge(
        &self,
        _edge_id: &str,
        _group_id: Option<&str>,
    ) -> Result<Option<CoreResult>, AppError> {
        Err(unsupported("get_edge", self.name()))
    }
}

/// Validates a node ID against the backend's declared `node_id_type`.
pub fn validate_node_id(id_type: IdKind, node_id: &str) -> Result<(), AppError> {
    if id_type == IdKind::Name && common::ids::looks_like_uuid_or_ulid(node_id) {
        return Err(AppError::IdNotSupported(format!(
            "this backend addresses nodes by entity names, but '{node_id}' looks like a UUID; pass an entity name instead"
        )));
    }
    Ok(())
}

/// Validates an edge ID against the backend's declared `edge_id_type`. A
/// `synthetic` edge ID must be of the shape `SOURCE||TARGET` with both
/// halves non-empty after trimming.
pub fn validate_edge_id(id_type: IdKind, edge_id: &str) -> Result<(), AppError> {
    if id_type != IdKind::Synthetic {
        return Ok(());
    }
    match edge_id.split_once("||") {
        Some((source, target))
            if !source.trim().is_empty() && !target.trim().is_empty() => Ok(()),
        _ => Err(AppError::IdNotSupported(format!(
            "this backend uses synthetic edge IDs of the shape SOURCE||TARGET; '{edge_id}' does not match"
        ))),
    }
}
