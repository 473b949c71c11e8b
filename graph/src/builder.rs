//! Arena-style graph assembly: threads, entries, and chunks live in flat
//! ID-keyed maps; cross-references are plain ID strings, never owned
//! pointers.

use std::collections::HashMap;

use cache::{EmbeddingCache, SummaryCache, ThreadSummaryCache};
use common::error::AppError;
use common::model::{ChunkNode, Edge, EntryNode, Hyperedge, ThreadNode};
use serde::{Deserialize, Serialize};

use crate::embed::embed_texts;
use crate::llm::{EmbeddingClient, LlmClient};
use crate::summarize::{summarize_entry, summarize_thread};

/// The full in-memory graph: flat maps of nodes plus flat edge/hyperedge
/// lists. JSON-serializable as a single document for `save`/`load`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    pub threads: HashMap<String, ThreadNode>,
    pub entries: HashMap<String, EntryNode>,
    pub chunks: HashMap<String, ChunkNode>,
    pub edges: Vec<Edge>,
    pub hyperedges: Vec<Hyperedge>,
}

/// Drives parser output through chunking, summarization, and embedding to
/// produce a fully materialized `Graph`.
#[derive(Default)]
pub struct GraphBuilder {
    pub graph: Graph,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Incorporates one thread's already-parsed nodes and edges. Entries
    /// keyed by their thread are appended in their existing order.
    pub fn add_thread(
        &mut self,
        thread: ThreadNode,
        entries: Vec<EntryNode>,
        edges: Vec<Edge>,
        hyperedges: Vec<Hyperedge>,
    ) {
        self.graph.threads.insert(thread.thread_id.clone(), thread);
        for entry in entries {
            self.graph.entries.insert(entry.entry_id.clone(), entry);
        }
        self.graph.edges.extend(edges);
        self.graph.hyperedges.extend(hyperedges);
    }

    /// Chunks every entry in thread-entry-index order, wiring `CONTAINS`
    /// edges and writing `chunk_ids` back onto each entry.
    pub fn chunk_all_entries(&mut self, config: &chunker::ChunkerConfig) {
        let mut ordered_entry_ids: Vec<String> = self.graph.entries.keys().cloned().collect();
        ordered_entry_ids.sort_by_key(|id| {
            self.graph
                .entries
                .get(id)
                .map_or(0, |e| e.sequence_index)
        });

        for entry_id in ordered_entry_ids {
            let Some(entry) = self.graph.entries.get(&entry_id) else {
                continue;
            };
            let (chunks, edges, _mapping) = chunker::chunk_entries(std::slice::from_ref(entry), config);
            let chunk_ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();

            for chunk in chunks {
                self.graph.chunks.insert(chunk.chunk_id.clone(), chunk);
            }
            self.graph.edges.extend(edges);

            if let Some(entry) = self.graph.entries.get_mut(&entry_id) {
                entry.chunk_ids = chunk_ids;
            }
        }
    }

    /// Summarizes every entry without a summary, then every thread without a
    /// summary from its entries' summaries. Failures never abort the build;
    /// they are recorded in `warnings`.
    pub async fn generate_summaries(
        &mut self,
        summary_cache: &SummaryCache,
        thread_summary_cache: &ThreadSummaryCache,
        llm: &LlmClient,
        warnings: &mut Vec<String>,
    ) {
        let mut entry_ids: Vec<String> = self.graph.entries.keys().cloned().collect();
        entry_ids.sort_by_key(|id| {
            self.graph
                .entries
                .get(id)
                .map_or(0, |e| e.sequence_index)
        });

        for entry_id in &entry_ids {
            let needs_summary = self
                .graph
                .entries
                .get(entry_id)
                .is_some_and(|e| e.summary.is_none());
            if !needs_summary {
                continue;
            }
            let Some(entry) = self.graph.entries.get(entry_id).cloned() else {
                continue;
            };
            let summary = summarize_entry(&entry, summary_cache, llm, warnings).await;
            if let Some(entry) = self.graph.entries.get_mut(entry_id) {
                entry.summary = Some(summary);
            }
        }

        let mut thread_ids: Vec<String> = self.graph.threads.keys().cloned().collect();
        thread_ids.sort();

        for thread_id in thread_ids {
            let needs_summary = self
                .graph
                .threads
                .get(&thread_id)
                .is_some_and(|t| t.summary.is_none());
            if !needs_summary {
                continue;
            }
            let Some(thread) = self.graph.threads.get(&thread_id).cloned() else {
                continue;
            };
            let entry_summaries: Vec<String> = thread
                .entry_ids
                .iter()
                .filter_map(|id| self.graph.entries.get(id))
                .filter_map(|e| e.summary.clone())
                .collect();
            let summary = summarize_thread(
                &thread,
                &entry_summaries,
                thread_summary_cache,
                llm,
                warnings,
            )
            .await;
            if let Some(thread) = self.graph.threads.get_mut(&thread_id) {
                thread.summary = Some(summary);
            }
        }
    }

    /// Collects every node with a summary/text but no embedding, embeds them
    /// in thread-summary, entry-summary, chunk-text order, and writes the
    /// vectors back.
    pub async fn generate_embeddings(
        &mut self,
        embedding_cache: &EmbeddingCache,
        client: &EmbeddingClient,
        batch_size: usize,
        max_concurrent: usize,
        warnings: &mut Vec<String>,
    ) {
        enum Target {
            Thread(String),
            Entry(String),
            Chunk(String),
        }

        let mut targets: Vec<Target> = Vec::new();
        let mut texts: Vec<String> = Vec::new();

        let mut thread_ids: Vec<String> = self.graph.threads.keys().cloned().collect();
        thread_ids.sort();
        for thread_id in thread_ids {
            if let Some(thread) = self.graph.threads.get(&thread_id) {
                if thread.embedding.is_none() {
                    if let Some(summary) = &thread.summary {
                        targets.push(Target::Thread(thread_id.clone()));
                        texts.push(summary.clone());
                    }
                }
            }
        }

        let mut entry_ids: Vec<String> = self.graph.entries.keys().cloned().collect();
        entry_ids.sort_by_key(|id| self.graph.entries.get(id).map_or(0, |e| e.sequence_index));
        for entry_id in entry_ids {
            if let Some(entry) = self.graph.entries.get(&entry_id) {
                if entry.embedding.is_none() {
                    if let Some(summary) = &entry.summary {
                        targets.push(Target::Entry(entry_id.clone()));
                        texts.push(summary.clone());
                    }
                }
            }
        }

        let mut chunk_ids: Vec<String> = self.graph.chunks.keys().cloned().collect();
        chunk_ids.sort_by_key(|id| self.graph.chunks.get(id).map_or(0, |c| c.index));
        for chunk_id in chunk_ids {
            if let Some(chunk) = self.graph.chunks.get(&chunk_id) {
                if chunk.embedding.is_none() {
                    targets.push(Target::Chunk(chunk_id.clone()));
                    texts.push(chunk.text.clone());
                }
            }
        }

        if targets.is_empty() {
            return;
        }

        let vectors = embed_texts(
            &texts,
            embedding_cache,
            client,
            batch_size,
            max_concurrent,
            warnings,
        )
        .await;

        for (target, vector) in targets.into_iter().zip(vectors.into_iter()) {
            let Some(vector) = vector else { continue };
            match target {
                Target::Thread(id) => {
                    if let Some(thread) = self.graph.threads.get_mut(&id) {
                        thread.embedding = Some(vector);
                    }
                }
                Target::Entry(id) => {
                    if let Some(entry) = self.graph.entries.get_mut(&id) {
                        entry.embedding = Some(vector);
                    }
                }
                Target::Chunk(id) => {
                    if let Some(chunk) = self.graph.chunks.get_mut(&id) {
                        chunk.embedding = Some(vector);
                    }
                }
            }
        }
    }

    /// Convenience composition: parses every thread file in `threads_dir`
    /// (via `thread-parser`), incorporates all of them, then chunks every
    /// entry. Does not generate summaries or embeddings — callers that need
    /// those invoke `generate_summaries`/`generate_embeddings` afterward.
    pub fn build(
        &mut self,
        threads_dir: &std::path::Path,
        thread_filter: Option<&[String]>,
        chunker_config: &chunker::ChunkerConfig,
        progress_cb: Option<&mut dyn FnMut(usize, usize, &str)>,
    ) {
        let (threads, entries, edges, hyperedges) =
            thread_parser::parse_threads(threads_dir, thread_filter);
        let total = threads.len();

        if let Some(cb) = progress_cb {
            for (i, thread) in threads.iter().enumerate() {
                cb(i + 1, total, &format!("parsed thread '{}'", thread.thread_id));
            }
        }

        for thread in threads {
            self.graph.threads.insert(thread.thread_id.clone(), thread);
        }
        for entry in entries {
            self.graph.entries.insert(entry.entry_id.clone(), entry);
        }
        self.graph.edges.extend(edges);
        self.graph.hyperedges.extend(hyperedges);

        self.chunk_all_entries(chunker_config);
    }

    /// Serializes the graph to `path` as pretty JSON via an atomic write.
    pub fn save(&self, path: &std::path::Path) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(&self.graph)?;
        cache::atomic_write(path, &bytes)
    }

    /// Loads a graph previously written by `save`.
    pub fn load(path: &std::path::Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        let graph: Graph = serde_json::from_str(&raw)?;
        Ok(Self { graph })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::{EdgeKind, EntryType, Role};

    fn sample_thread() -> (ThreadNode, Vec<EntryNode>, Vec<Edge>, Vec<Hyperedge>) {
        let thread = ThreadNode {
            thread_id: "t1".to_string(),
            title: "Thread One".to_string(),
            status: "OPEN".to_string(),
            ball: "alice".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            entry_ids: vec!["t1:0".to_string()],
            branch_context: None,
            summary: None,
            embedding: None,
        };
        let entry = EntryNode {
            entry_id: "t1:0".to_string(),
            thread_id: "t1".to_string(),
            index: 0,
            agent: "alice".to_string(),
            role: Some(Role::Planner),
            entry_type: Some(EntryType::Note),
            title: None,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            body: "A short body.".to_string(),
            chunk_ids: Vec::new(),
            sequence_index: 0,
            preceding_entry_id: None,
            following_entry_id: None,
            summary: None,
            embedding: None,
        };
        let edges = vec![Edge::contains("t1", "t1:0", None)];
        (thread, vec![entry], edges, Vec::new())
    }

    #[test]
    fn add_thread_populates_arena_maps() {
        let mut builder = GraphBuilder::new();
        let (thread, entries, edges, hyperedges) = sample_thread();
        builder.add_thread(thread, entries, edges, hyperedges);
        assert_eq!(builder.graph.threads.len(), 1);
        assert_eq!(builder.graph.entries.len(), 1);
        assert_eq!(builder.graph.edges.len(), 1);
    }

    #[test]
    fn chunk_all_entries_wires_contains_edges() {
        let mut builder = GraphBuilder::new();
        let (thread, entries, edges, hyperedges) = sample_thread();
        builder.add_thread(thread, entries, edges, hyperedges);
        let config = chunker::ChunkerConfig::default();
        builder.chunk_all_entries(&config);
        assert_eq!(builder.graph.chunks.len(), 1);
        assert!(
            builder
                .graph
                .edges
                .iter()
                .any(|e| e.kind == EdgeKind::Contains && e.source_id == "t1:0")
        );
        let entry = builder.graph.entries.get("t1:0").unwrap();
        assert_eq!(entry.chunk_ids.len(), 1);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = GraphBuilder::new();
        let (thread, entries, edges, hyperedges) = sample_thread();
        builder.add_thread(thread, entries, edges, hyperedges);
        let path = dir.path().join("graph.json");
        builder.save(&path).unwrap();
        let loaded = GraphBuilder::load(&path).unwrap();
        assert_eq!(loaded.graph.threads.len(), 1);
        assert_eq!(loaded.graph.entries.len(), 1);
    }
}
