//! Content-addressed disk caches for LLM summaries and vector embeddings.
//!
//! Every cache key is derived from a sha256 digest, truncated to 16 hex
//! characters, and every write goes through [`atomic_write`] (temp file in
//! the same directory, then rename) so a crash never leaves a half-written
//! file that a later run would read back as a cache hit.

use std::io::Write;
use std::path::{Path, PathBuf};

use common::error::AppError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `sha256(prefix || content)`, truncated to 16 hex characters.
#[must_use]
pub fn content_hash(content: &str, prefix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex.chars().take(16).collect()
}

/// Replaces every byte outside `[A-Za-z0-9_-]` with `_`, making `key` safe as
/// a filename.
#[must_use]
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Writes `bytes` to `path` via a same-directory temp file, then renames it
/// into place, so readers never observe a partially-written file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .map_err(|e| AppError::Io(e.error))?;
    Ok(())
}

fn create_private_dir(dir: &Path) -> Result<(), AppError> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(dir)?.permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SummaryRecord {
    entry_id: String,
    body_hash: String,
    summary: String,
}

/// Disk cache for per-entry LLM-generated summaries, invalidated when the
/// entry body's content hash changes.
pub struct SummaryCache {
    cache_dir: PathBuf,
}

impl SummaryCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self, AppError> {
        create_private_dir(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    fn key_path(&self, entry_id: &str, body_hash: &str) -> PathBuf {
        let key = if entry_id.is_empty() { body_hash } else { entry_id };
        self.cache_dir.join(format!("{}.json", sanitize_key(key)))
    }

    /// Returns the cached summary for `(entry_id, body)`, or `None` on a miss
    /// or a body-hash mismatch (entry_id reused for different content).
    #[must_use]
    pub fn get(&self, entry_id: &str, body: &str) -> Option<String> {
        let body_hash = content_hash(body, "");
        let path = self.key_path(entry_id, &body_hash);
        let raw = std::fs::read_to_string(path).ok()?;
        let record: SummaryRecord = serde_json::from_str(&raw).ok()?;
        if record.body_hash == body_hash {
            Some(record.summary)
        } else {
            None
        }
    }

    pub fn set(&self, entry_id: &str, body: &str, summary: &str) -> Result<(), AppError> {
        let body_hash = content_hash(body, "");
        let path = self.key_path(entry_id, &body_hash);
        let record = SummaryRecord {
            entry_id: entry_id.to_string(),
            body_hash,
            summary: summary.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        atomic_write(&path, &bytes)?;
        tracing::debug!(entry_id, "wrote summary cache entry");
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        directory_stats(&self.cache_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThreadSummaryRecord {
    thread_id: String,
    entry_count: usize,
    summary: String,
}

/// Disk cache for thread-level summaries, invalidated by entry count rather
/// than content hash (a thread grows by appending entries, never editing).
pub struct ThreadSummaryCache {
    cache_dir: PathBuf,
}

impl ThreadSummaryCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self, AppError> {
        create_private_dir(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    fn key_path(&self, thread_id: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.json", sanitize_key(thread_id)))
    }

    #[must_use]
    pub fn get(&self, thread_id: &str, entry_count: usize) -> Option<String> {
        let path = self.key_path(thread_id);
        let raw = std::fs::read_to_string(path).ok()?;
        let record: ThreadSummaryRecord = serde_json::from_str(&raw).ok()?;
        if record.entry_count == entry_count {
            Some(record.summary)
        } else {
            None
        }
    }

    pub fn set(
        &self,
        thread_id: &str,
        entry_count: usize,
        summary: &str,
    ) -> Result<(), AppError> {
        let path = self.key_path(thread_id);
        let record = ThreadSummaryRecord {
            thread_id: thread_id.to_string(),
            entry_count,
            summary: summary.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        atomic_write(&path, &bytes)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        directory_stats(&self.cache_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddingRecord {
    text_hash: String,
    embedding: Vec<f32>,
}

/// Disk cache for text embeddings, keyed by the hash of the source text.
pub struct EmbeddingCache {
    cache_dir: PathBuf,
}

impl EmbeddingCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self, AppError> {
        create_private_dir(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    fn key_path(&self, text: &str) -> PathBuf {
        let hash = content_hash(text, "");
        self.cache_dir.join(format!("{}.json", sanitize_key(&hash)))
    }

    #[must_use]
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let path = self.key_path(text);
        let raw = std::fs::read_to_string(path).ok()?;
        let record: EmbeddingRecord = serde_json::from_str(&raw).ok()?;
        Some(record.embedding)
    }

    pub fn set(&self, text: &str, embedding: &[f32]) -> Result<(), AppError> {
        let path = self.key_path(text);
        let record = EmbeddingRecord {
            text_hash: content_hash(text, ""),
            embedding: embedding.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        atomic_write(&path, &bytes)
    }

    /// Looks up every text in `texts`, returning a parallel vector (`None` on
    /// miss) plus the indices that missed, so callers only send misses over
    /// the wire.
    #[must_use]
    pub fn get_many(&self, texts: &[String]) -> (Vec<Option<Vec<f32>>>, Vec<usize>) {
        let mut results = Vec::with_capacity(texts.len());
        let mut missing = Vec::new();
        for (idx, text) in texts.iter().enumerate() {
            let hit = self.get(text);
            if hit.is_none() {
                missing.push(idx);
            }
            results.push(hit);
        }
        (results, missing)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        directory_stats(&self.cache_dir)
    }
}

/// Aggregate cache occupancy, as reported by `stats()` on any of the caches.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub size_bytes: u64,
}

fn directory_stats(dir: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return stats;
    };
    for entry in entries.flatten() {
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            stats.count += 1;
            stats.size_bytes += meta.len();
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SummaryCache::new(dir.path().join("summaries")).unwrap();
        assert!(cache.get("e1", "hello world").is_none());
        cache.set("e1", "hello world", "a greeting").unwrap();
        assert_eq!(
            cache.get("e1", "hello world"),
            Some("a greeting".to_string())
        );
    }

    #[test]
    fn summary_cache_invalidates_on_body_change() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SummaryCache::new(dir.path().join("summaries")).unwrap();
        cache.set("e1", "hello world", "a greeting").unwrap();
        assert!(cache.get("e1", "goodbye world").is_none());
    }

    #[test]
    fn thread_summary_cache_invalidates_on_entry_count() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ThreadSummaryCache::new(dir.path().join("thread_summaries")).unwrap();
        cache.set("t1", 3, "three entries").unwrap();
        assert_eq!(cache.get("t1", 3), Some("three entries".to_string()));
        assert!(cache.get("t1", 4).is_none());
    }

    #[test]
    fn embedding_cache_reports_missing_indices() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings")).unwrap();
        cache.set("alpha", &[1.0, 2.0]).unwrap();
        let (results, missing) = cache.get_many(&["alpha".to_string(), "beta".to_string()]);
        assert_eq!(results[0], Some(vec![1.0, 2.0]));
        assert_eq!(results[1], None);
        assert_eq!(missing, vec![1]);
    }

    #[test]
    fn sanitize_key_replaces_unsafe_chars() {
        assert_eq!(sanitize_key("thread/alpha:beta"), "thread_alpha_beta");
    }
}
