//! The core node/edge data model: threads, entries, chunks, and the edges
//! that relate them. Nodes live in flat, ID-keyed maps (an arena) rather than
//! an owned tree — cross-references are plain ID strings.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Thread statuses considered closed. Comparison is always casefolded.
pub const CLOSED_STATES: [&str; 6] = [
    "done",
    "closed",
    "merged",
    "resolved",
    "abandoned",
    "obsolete",
];

/// Root of a conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadNode {
    pub thread_id: String,
    pub title: String,
    pub status: String,
    pub ball: String,
    pub created_at: String,
    pub updated_at: String,
    pub entry_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ThreadNode {
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.thread_id
    }

    /// Whether the thread's status falls in the closed set, after casefolding.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let normalized = self.status.to_lowercase();
        CLOSED_STATES.contains(&normalized.as_str())
    }
}

/// Conversational roles recognized in an entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Critic,
    Implementer,
    Tester,
    Pm,
    Scribe,
}

/// Entry content categories recognized in an entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Note,
    Plan,
    Decision,
    Pr,
    Closure,
}

/// A single append-only contribution within a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryNode {
    pub entry_id: String,
    pub thread_id: String,
    pub index: usize,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<EntryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub timestamp: String,
    pub body: String,
    #[serde(default)]
    pub chunk_ids: Vec<String>,
    pub sequence_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preceding_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl EntryNode {
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.entry_id
    }
}

/// A token-bounded substring of an entry body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkNode {
    pub chunk_id: String,
    pub entry_id: String,
    pub thread_id: String,
    pub index: usize,
    pub text: String,
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// The directed relation kinds produced by this crate. Backends may add more
/// kinds to the exported edge list; those are passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EdgeKind {
    Contains,
    Follows,
}

/// A directed edge between any two node IDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub kind: EdgeKind,
    pub source_id: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
}

impl Edge {
    #[must_use]
    pub fn contains(parent_id: &str, child_id: &str, event_time: Option<String>) -> Self {
        Self {
            kind: EdgeKind::Contains,
            source_id: parent_id.to_string(),
            target_id: child_id.to_string(),
            event_time,
        }
    }

    #[must_use]
    pub fn follows(preceding_id: &str, following_id: &str, event_time: Option<String>) -> Self {
        Self {
            kind: EdgeKind::Follows,
            source_id: preceding_id.to_string(),
            target_id: following_id.to_string(),
            event_time,
        }
    }
}

/// A one-to-many membership relation, e.g. a thread's full set of entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperedge {
    pub thread_id: String,
    pub entry_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
}

impl Hyperedge {
    #[must_use]
    pub fn thread_membership(
        thread_id: &str,
        entry_ids: Vec<String>,
        event_time: Option<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            entry_ids,
            event_time,
        }
    }
}

/// Deduplicates `FOLLOWS` edges by `(source_id, target_id)`, keeping the first
/// occurrence; used when merging edges from independently-parsed threads.
#[must_use]
pub fn dedupe_follows_edges(edges: Vec<Edge>) -> Vec<Edge> {
    let mut seen = HashSet::new();
    edges
        .into_iter()
        .filter(|edge| {
            if edge.kind != EdgeKind::Follows {
                return true;
            }
            seen.insert((edge.source_id.clone(), edge.target_id.clone()))
        })
        .collect()
}
