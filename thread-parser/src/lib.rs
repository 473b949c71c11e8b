//! Parses append-only markdown thread files into the graph's node/edge model.
//!
//! A thread file is a header block (`Title:`/`Status:`/`Ball:`/`Updated:`
//! key-value lines) followed by `---`-delimited entries, each introduced by
//! either `Entry: <agent> <RFC-3339 timestamp>` (current format) or
//! `- Updated: <timestamp> by <agent>` (legacy format).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use common::error::AppError;
use common::model::{Edge, EntryNode, EntryType, Hyperedge, Role, ThreadNode};
use regex::Regex;
use tracing::warn;

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"(?m)^#\s*(.+)$").unwrap())
}

fn status_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"(?mi)^Status:\s*(.+)$").unwrap())
}

fn ball_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"(?mi)^Ball:\s*(.+)$").unwrap())
}

fn updated_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"(?mi)^Updated:\s*(.+)$").unwrap())
}

fn updated_by_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^-\s*Updated:\s*([^\n]+?)(?:\s+by\s+([^\n]+?))?\s*$").unwrap()
    })
}

fn entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| {
        Regex::new(r"(?m)^Entry:\s*([^\d]+?)\s+(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z)\s*$").unwrap()
    })
}

fn role_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"(?mi)^Role:\s*(.+)$").unwrap())
}

fn type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"(?mi)^Type:\s*(.+)$").unwrap())
}

fn entry_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"(?mi)^Title:\s*(.+)$").unwrap())
}

fn entry_id_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"<!--\s*Entry-ID:\s*([^\s]+?)\s*-->").unwrap())
}

fn parse_role(value: &str) -> Option<Role> {
    match value.trim().to_lowercase().as_str() {
        "planner" => Some(Role::Planner),
        "critic" => Some(Role::Critic),
        "implementer" => Some(Role::Implementer),
        "tester" => Some(Role::Tester),
        "pm" => Some(Role::Pm),
        "scribe" => Some(Role::Scribe),
        _ => None,
    }
}

fn parse_entry_type(value: &str) -> Option<EntryType> {
    match value.trim().to_lowercase().as_str() {
        "note" => Some(EntryType::Note),
        "plan" => Some(EntryType::Plan),
        "decision" => Some(EntryType::Decision),
        "pr" => Some(EntryType::Pr),
        "closure" => Some(EntryType::Closure),
        _ => None,
    }
}

/// Thread-level header metadata extracted independently of entry parsing.
struct ThreadMeta {
    title: String,
    status: String,
    ball: String,
    last_update: String,
}

fn thread_meta(content: &str, topic: &str) -> ThreadMeta {
    let title = title_re()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| topic.to_string());

    let status = status_re()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_lowercase())
        .unwrap_or_else(|| "open".to_string());

    let ball = ball_re()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let last_update = last_entry_timestamp(content)
        .or_else(|| last_updated_timestamp(content))
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    ThreadMeta {
        title,
        status,
        ball,
        last_update,
    }
}

fn last_entry_timestamp(content: &str) -> Option<String> {
    entry_re()
        .captures_iter(content)
        .last()
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().to_string())
}

fn last_updated_timestamp(content: &str) -> Option<String> {
    updated_re()
        .captures_iter(content)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .or_else(|| {
            updated_by_re()
                .captures_iter(content)
                .last()
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
        })
}

struct RawEntry {
    agent: String,
    timestamp: String,
    role: Option<Role>,
    entry_type: Option<EntryType>,
    title: Option<String>,
    entry_id: Option<String>,
    body: String,
}

enum Marker {
    New { agent: String, timestamp: String },
    Legacy { agent: String, timestamp: String },
}

fn parse_entries(content: &str) -> Vec<RawEntry> {
    let lines: Vec<&str> = content.lines().collect();
    let mut markers: Vec<(usize, Marker)> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = entry_re().captures(line) {
            let agent = caps.get(1).map_or(String::new(), |m| m.as_str().trim().to_string());
            let timestamp = caps.get(2).map_or(String::new(), |m| m.as_str().to_string());
            markers.push((idx, Marker::New { agent, timestamp }));
            continue;
        }
        if let Some(caps) = updated_by_re().captures(line) {
            let timestamp = caps.get(1).map_or(String::new(), |m| m.as_str().trim().to_string());
            let agent = caps
                .get(2)
                .map_or_else(|| "unknown".to_string(), |m| m.as_str().trim().to_string());
            markers.push((idx, Marker::Legacy { agent, timestamp }));
        }
    }

    let mut entries = Vec::with_capacity(markers.len());
    for (pos, (line_idx, marker)) in markers.iter().enumerate() {
        let body_start = line_idx + 1;
        let body_end = markers.get(pos + 1).map_or(lines.len(), |(next, _)| *next);
        let block: Vec<&str> = lines
            .get(body_start..body_end)
            .unwrap_or_default()
            .to_vec();

        let (agent, timestamp) = match marker {
            Marker::New { agent, timestamp } | Marker::Legacy { agent, timestamp } => {
                (agent.clone(), timestamp.clone())
            }
        };

        let block_text = block.join("\n");
        let role = role_re()
            .captures(&block_text)
            .and_then(|c| c.get(1))
            .and_then(|m| parse_role(m.as_str()));
        let entry_type = type_re()
            .captures(&block_text)
            .and_then(|c| c.get(1))
            .and_then(|m| parse_entry_type(m.as_str()));
        let title = entry_title_re()
            .captures(&block_text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());
        let entry_id = entry_id_comment_re()
            .captures(&block_text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());

        let body = strip_header_lines(&block);

        entries.push(RawEntry {
            agent,
            timestamp,
            role,
            entry_type,
            title,
            entry_id,
            body,
        });
    }

    entries
}

/// Removes the `Role:`/`Type:`/`Title:` header lines, the `Entry-ID` comment,
/// and the leading `---` separator, leaving the entry's prose body.
fn strip_header_lines(block: &[&str]) -> String {
    let mut body_lines = Vec::with_capacity(block.len());
    for line in block {
        let trimmed = line.trim();
        if trimmed == "---" {
            continue;
        }
        if role_re().is_match(line) || type_re().is_match(line) || entry_title_re().is_match(line)
        {
            continue;
        }
        if entry_id_comment_re().is_match(line) && trimmed.starts_with("<!--") {
            continue;
        }
        body_lines.push(*line);
    }
    while body_lines.first().is_some_and(|l| l.trim().is_empty()) {
        body_lines.remove(0);
    }
    while body_lines.last().is_some_and(|l| l.trim().is_empty()) {
        body_lines.pop();
    }
    body_lines.join("\n")
}

/// Parses one thread file into its node and edge set. Never fails on a single
/// malformed entry; parsing only errors if the file itself cannot be read.
pub fn parse_thread(
    path: &Path,
    branch_context: Option<&str>,
) -> Result<(ThreadNode, Vec<EntryNode>, Vec<Edge>, Vec<Hyperedge>), AppError> {
    let content = std::fs::read_to_string(path)?;
    let topic = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("thread")
        .to_string();

    let meta = thread_meta(&content, &topic);
    let raw_entries = parse_entries(&content);

    let mut entry_ids = Vec::with_capacity(raw_entries.len());
    let mut entries = Vec::with_capacity(raw_entries.len());

    for (i, raw) in raw_entries.iter().enumerate() {
        let entry_id = raw
            .entry_id
            .clone()
            .unwrap_or_else(|| format!("{topic}:{i}"));
        entry_ids.push(entry_id.clone());
        let preceding_entry_id = entry_ids.get(i.wrapping_sub(1)).filter(|_| i > 0).cloned();

        entries.push(EntryNode {
            entry_id,
            thread_id: topic.clone(),
            index: i,
            agent: raw.agent.clone(),
            role: raw.role,
            entry_type: raw.entry_type,
            title: raw.title.clone(),
            timestamp: raw.timestamp.clone(),
            body: raw.body.clone(),
            chunk_ids: Vec::new(),
            sequence_index: i,
            preceding_entry_id,
            following_entry_id: None,
            summary: None,
            embedding: None,
        });
    }

    let len = entries.len();
    for (i, entry) in entries.iter_mut().enumerate() {
        if i + 1 < len {
            entry.following_entry_id = entry_ids.get(i + 1).cloned();
        }
    }

    let created_at = entries
        .first()
        .map(|e| e.timestamp.clone())
        .unwrap_or_else(|| meta.last_update.clone());

    let thread = ThreadNode {
        thread_id: topic.clone(),
        title: meta.title,
        status: meta.status.to_uppercase(),
        ball: meta.ball,
        created_at,
        updated_at: meta.last_update.clone(),
        entry_ids: entry_ids.clone(),
        branch_context: branch_context.map(str::to_string),
        summary: None,
        embedding: None,
    };

    let mut edges = Vec::new();
    for entry in &entries {
        edges.push(Edge::contains(
            thread.node_id(),
            entry.node_id(),
            Some(entry.timestamp.clone()),
        ));
    }
    for window in entries.windows(2) {
        let [first, second] = window else {
            continue;
        };
        edges.push(Edge::follows(
            first.node_id(),
            second.node_id(),
            Some(second.timestamp.clone()),
        ));
    }

    let mut hyperedges = Vec::new();
    if !entry_ids.is_empty() {
        hyperedges.push(Hyperedge::thread_membership(
            &topic,
            entry_ids,
            Some(thread.created_at.clone()),
        ));
    }

    Ok((thread, entries, edges, hyperedges))
}

/// Parses every thread in `threads_dir`, skipping `_`-prefixed and `index`
/// files. If `thread_filter` is given, only those filenames are processed (in
/// sorted order); a missing filtered file is logged and skipped. Individual
/// parse failures are logged and skipped — the walk always returns the
/// threads that parsed successfully.
pub fn parse_threads(
    threads_dir: &Path,
    thread_filter: Option<&[String]>,
) -> (Vec<ThreadNode>, Vec<EntryNode>, Vec<Edge>, Vec<Hyperedge>) {
    if !threads_dir.exists() {
        return (Vec::new(), Vec::new(), Vec::new(), Vec::new());
    }

    let mut paths: Vec<PathBuf> = match thread_filter {
        Some(names) => names
            .iter()
            .filter_map(|name| {
                let candidate = threads_dir.join(name);
                if candidate.exists() {
                    Some(candidate)
                } else {
                    warn!(file = %candidate.display(), "thread file not found");
                    None
                }
            })
            .collect(),
        None => std::fs::read_dir(threads_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
                    .collect()
            })
            .unwrap_or_default(),
    };
    paths.sort();

    let mut threads = Vec::new();
    let mut entries = Vec::new();
    let mut edges = Vec::new();
    let mut hyperedges = Vec::new();

    for path in paths {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if stem.starts_with('_') || stem == "index" {
            continue;
        }

        match parse_thread(&path, None) {
            Ok((thread, thread_entries, thread_edges, thread_hyperedges)) => {
                threads.push(thread);
                entries.extend(thread_entries);
                edges.extend(thread_edges);
                hyperedges.extend(thread_hyperedges);
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to parse thread");
            }
        }
    }

    (threads, entries, edges, hyperedges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_thread(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_header_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let content = "# My Thread\nStatus: open\nBall: alice\nUpdated: 2026-01-01T00:00:00Z\n\n---\nEntry: alice 2026-01-01T00:00:00Z\nRole: planner\nType: Plan\nTitle: Kickoff\n\nLet's start the project.\n\n---\nEntry: bob 2026-01-02T00:00:00Z\n\nSounds good, I'll begin.\n";
        let path = write_thread(dir.path(), "alpha.md", content);

        let (thread, entries, edges, hyperedges) = parse_thread(&path, None).unwrap();
        assert_eq!(thread.thread_id, "alpha");
        assert_eq!(thread.title, "My Thread");
        assert_eq!(thread.status, "OPEN");
        assert_eq!(thread.ball, "alice");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].agent, "alice");
        assert_eq!(entries[0].role, Some(Role::Planner));
        assert_eq!(entries[0].title.as_deref(), Some("Kickoff"));
        assert!(entries[0].body.contains("Let's start"));
        assert_eq!(entries[0].following_entry_id.as_deref(), Some("alpha:1"));
        assert_eq!(entries[1].preceding_entry_id.as_deref(), Some("alpha:0"));
        assert_eq!(edges.len(), 3); // 2 CONTAINS + 1 FOLLOWS
        assert_eq!(hyperedges.len(), 1);
        assert_eq!(hyperedges[0].entry_ids.len(), 2);
    }

    #[test]
    fn empty_file_yields_empty_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_thread(dir.path(), "empty.md", "");
        let (thread, entries, edges, hyperedges) = parse_thread(&path, None).unwrap();
        assert_eq!(thread.title, "empty");
        assert_eq!(thread.status, "OPEN");
        assert!(entries.is_empty());
        assert!(edges.is_empty());
        assert!(hyperedges.is_empty());
    }

    #[test]
    fn legacy_format_entries_are_recognized() {
        let dir = tempfile::tempdir().unwrap();
        let content = "Status: closed\n\n- Updated: 2026-01-01T00:00:00Z by carol\nWrapping up the thread.\n";
        let path = write_thread(dir.path(), "legacy.md", content);
        let (thread, entries, _, _) = parse_thread(&path, None).unwrap();
        assert!(thread.is_closed());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].agent, "carol");
    }

    #[test]
    fn explicit_entry_id_comment_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let content = "Status: open\n\n---\nEntry: dave 2026-01-01T00:00:00Z\n<!-- Entry-ID: custom-id -->\n\nBody text.\n";
        let path = write_thread(dir.path(), "ided.md", content);
        let (_, entries, _, _) = parse_thread(&path, None).unwrap();
        assert_eq!(entries[0].entry_id, "custom-id");
    }

    #[test]
    fn directory_walk_skips_underscore_and_index() {
        let dir = tempfile::tempdir().unwrap();
        write_thread(dir.path(), "alpha.md", "Status: open\n");
        write_thread(dir.path(), "_draft.md", "Status: open\n");
        write_thread(dir.path(), "index.md", "Status: open\n");
        let (threads, _, _, _) = parse_threads(dir.path(), None);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread_id, "alpha");
    }
}
