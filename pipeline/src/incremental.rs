//! Per-topic cached artifacts that let an incremental run skip threads whose
//! file metadata hasn't changed since the last successful run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use common::error::AppError;
use serde::{Deserialize, Serialize};

const STATE_VERSION: &str = "1.0";

/// Cached artifacts for one topic (thread), keyed by `(mtime, entry_count)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicState {
    pub topic: String,
    pub mtime: i64,
    pub entry_count: usize,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub entry_summaries: HashMap<String, String>,
    #[serde(default)]
    pub entry_embeddings: HashMap<String, Vec<f32>>,
}

/// Durable per-run incremental state: one `TopicState` per topic, written to
/// `<work_dir>/state.json` (distinct from the per-run `state/<run_id>.json`
/// record — this file persists across runs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalState {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub last_run: String,
    #[serde(default)]
    pub topics: HashMap<String, TopicState>,
}

fn default_version() -> String {
    STATE_VERSION.to_string()
}

impl Default for IncrementalState {
    fn default() -> Self {
        Self {
            version: default_version(),
            last_run: String::new(),
            topics: HashMap::new(),
        }
    }
}

impl IncrementalState {
    /// Loads `path`. A corrupted or unreadable file is a hard error,
    /// matching the durability policy applied to `PipelineState` — see
    /// `SPEC_FULL.md` §9.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&raw)?;
        Ok(state)
    }

    pub fn save(&mut self, path: &Path) -> Result<(), AppError> {
        self.last_run = Utc::now().to_rfc3339();
        let bytes = serde_json::to_vec_pretty(self)?;
        cache::atomic_write(path, &bytes)
    }

    /// A topic is changed iff there is no cached entry, or its mtime or
    /// entry count differs from the cached values.
    #[must_use]
    pub fn is_topic_changed(&self, topic: &str, mtime: i64, entry_count: usize) -> bool {
        match self.topics.get(topic) {
            None => true,
            Some(cached) => cached.mtime != mtime || cached.entry_count != entry_count,
        }
    }

    #[must_use]
    pub fn cached_summary(&self, topic: &str) -> Option<String> {
        self.topics
            .get(topic)
            .map(|t| t.summary.clone())
            .filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn cached_entry_summary(&self, topic: &str, entry_id: &str) -> Option<String> {
        self.topics
            .get(topic)
            .and_then(|t| t.entry_summaries.get(entry_id))
            .cloned()
    }

    #[must_use]
    pub fn cached_entry_embedding(&self, topic: &str, entry_id: &str) -> Option<Vec<f32>> {
        self.topics
            .get(topic)
            .and_then(|t| t.entry_embeddings.get(entry_id))
            .cloned()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_topic(
        &mut self,
        topic: String,
        mtime: i64,
        entry_count: usize,
        summary: String,
        entry_summaries: HashMap<String, String>,
        entry_embeddings: HashMap<String, Vec<f32>>,
    ) {
        self.topics.insert(
            topic.clone(),
            TopicState {
                topic,
                mtime,
                entry_count,
                summary,
                entry_summaries,
                entry_embeddings,
            },
        );
    }

    /// Removes topics no longer present in `current_topics`, returning the
    /// removed topic names.
    pub fn remove_deleted_topics(&mut self, current_topics: &HashSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .topics
            .keys()
            .filter(|t| !current_topics.contains(*t))
            .cloned()
            .collect();
        for topic in &stale {
            self.topics.remove(topic);
        }
        stale
    }
}

#[must_use]
pub fn incremental_state_path(work_dir: &Path) -> PathBuf {
    work_dir.join("state.json")
}

/// File `mtime` as whole seconds since the Unix epoch, `0` if unavailable.
#[must_use]
pub fn file_mtime_secs(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// The outcome of scanning a thread directory against cached state: topics
/// needing reprocessing and topics whose cached artifacts can be reused.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub changed: Vec<String>,
    pub cached: Vec<String>,
}

/// Classifies every `.md` file in `threads_dir` as changed or cached against
/// `state`. Never errors on a missing directory — returns an empty set.
#[must_use]
pub fn detect_changes(threads_dir: &Path, state: &IncrementalState) -> ChangeSet {
    let mut result = ChangeSet::default();
    let Ok(entries) = std::fs::read_dir(threads_dir) else {
        return result;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(topic) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if topic.starts_with('_') || topic == "index" {
            continue;
        }
        let mtime = file_mtime_secs(&path);
        let entry_count = thread_parser::parse_thread(&path, None)
            .map(|(_, entries, _, _)| entries.len())
            .unwrap_or(0);
        if state.is_topic_changed(topic, mtime, entry_count) {
            result.changed.push(topic.to_string());
        } else {
            result.cached.push(topic.to_string());
        }
    }
    result.changed.sort();
    result.cached.sort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn new_topic_is_changed() {
        let state = IncrementalState::default();
        assert!(state.is_topic_changed("alpha", 123, 2));
    }

    #[test]
    fn unchanged_mtime_and_count_is_not_changed() {
        let mut state = IncrementalState::default();
        state.update_topic(
            "alpha".to_string(),
            123,
            2,
            "s".to_string(),
            HashMap::new(),
            HashMap::new(),
        );
        assert!(!state.is_topic_changed("alpha", 123, 2));
        assert!(state.is_topic_changed("alpha", 123, 3));
        assert!(state.is_topic_changed("alpha", 124, 2));
    }

    #[test]
    fn remove_deleted_topics_prunes_stale_entries() {
        let mut state = IncrementalState::default();
        state.update_topic(
            "alpha".to_string(),
            1,
            1,
            String::new(),
            HashMap::new(),
            HashMap::new(),
        );
        state.update_topic(
            "beta".to_string(),
            1,
            1,
            String::new(),
            HashMap::new(),
            HashMap::new(),
        );
        let current: HashSet<String> = ["alpha".to_string()].into_iter().collect();
        let removed = state.remove_deleted_topics(&current);
        assert_eq!(removed, vec!["beta".to_string()]);
        assert_eq!(state.topics.len(), 1);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = incremental_state_path(dir.path());
        let mut state = IncrementalState::default();
        state.update_topic(
            "alpha".to_string(),
            10,
            1,
            "summary".to_string(),
            HashMap::new(),
            HashMap::new(),
        );
        state.save(&path).unwrap();
        let loaded = IncrementalState::load(&path).unwrap();
        assert_eq!(loaded.topics["alpha"].entry_count, 1);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let state = IncrementalState::load(&path).unwrap();
        assert!(state.topics.is_empty());
    }

    #[test]
    fn detect_changes_classifies_new_thread_as_changed() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("alpha.md")).unwrap();
        writeln!(f, "Title: A\nStatus: OPEN\nBall: x\nUpdated: 2026-01-01T00:00:00Z\n").unwrap();
        let state = IncrementalState::default();
        let changes = detect_changes(dir.path(), &state);
        assert_eq!(changes.changed, vec!["alpha".to_string()]);
        assert!(changes.cached.is_empty());
    }
}
