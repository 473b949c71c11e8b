//! Splits entry bodies into token-bounded chunks, preferring paragraph and
//! sentence boundaries over a hard cut.

use std::sync::OnceLock;

use common::model::{ChunkNode, Edge, EntryNode, EntryType, Role};
use regex::Regex;
use sha2::{Digest, Sha256};
use tiktoken_rs::CoreBPE;

const DEFAULT_MAX_TOKENS: usize = 1024;
const DEFAULT_OVERLAP: usize = 128;

/// Chunking configuration. The watercooler preset tightens the bounds and
/// prepends a metadata header chunk to every entry.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
    pub overlap: usize,
    pub include_header: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap: DEFAULT_OVERLAP,
            include_header: false,
        }
    }
}

impl ChunkerConfig {
    #[must_use]
    pub fn watercooler_preset() -> Self {
        Self {
            max_tokens: 768,
            overlap: 64,
            include_header: true,
        }
    }
}

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| tiktoken_rs::cl100k_base().ok())
        .as_ref()
}

/// Counts tokens via a cl100k_base BPE encoder, falling back to a
/// characters-divided-by-four estimate if the encoder could not be loaded.
#[must_use]
pub fn count_tokens(text: &str) -> usize {
    match encoder() {
        Some(enc) => enc.encode_with_special_tokens(text).len(),
        None => text.chars().count() / 4,
    }
}

fn sentence_re() -> &'static Regex {
    // The `regex` crate has no lookbehind support, so the sentence boundary
    // is matched as terminator-plus-whitespace and split just after the
    // (single-byte, ASCII) terminator rather than via `(?<=[.!?])\s+`.
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").unwrap())
}

fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    let re = sentence_re();
    let mut sentences = Vec::new();
    let mut last = 0usize;
    for m in re.find_iter(text) {
        // The terminator is always the single ASCII byte at the match start,
        // so `m.start() + 1` is a valid char boundary.
        let term_end = m.start() + 1;
        sentences.push(text[last..term_end].to_string());
        last = m.end();
    }
    if last < text.len() {
        sentences.push(text[last..].to_string());
    }
    sentences
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn chunk_id(entry_id: &str, index: usize, text: &str) -> String {
    let content = format!("{entry_id}:{index}:{text}");
    let digest = Sha256::digest(content.as_bytes());
    format!("{digest:x}").chars().take(16).collect()
}

/// Splits a sentence run of a single oversized paragraph, applying
/// sentence-level overlap across chunk boundaries. Returns `(text, tokens)`
/// pairs to be appended to `out`.
fn chunk_sentences(paragraph: &str, max_tokens: usize, overlap: usize, out: &mut Vec<String>) {
    let sentences = split_sentences(paragraph);
    let mut buffer: Vec<String> = Vec::new();
    let mut buffer_tokens = 0usize;

    for sentence in sentences {
        let sentence_tokens = count_tokens(&sentence);
        if buffer_tokens + sentence_tokens > max_tokens && !buffer.is_empty() {
            out.push(buffer.join(" "));

            let mut overlap_sentences: Vec<String> = Vec::new();
            let mut overlap_tokens = 0usize;
            for s in buffer.iter().rev() {
                let s_tokens = count_tokens(s);
                if overlap_tokens + s_tokens <= overlap {
                    overlap_sentences.insert(0, s.clone());
                    overlap_tokens += s_tokens;
                } else {
                    break;
                }
            }
            buffer = overlap_sentences;
            buffer_tokens = overlap_tokens;
        }
        buffer_tokens += sentence_tokens;
        buffer.push(sentence);
    }

    if !buffer.is_empty() {
        out.push(buffer.join(" "));
    }
}

/// Splits `text` into `(chunk_text, token_count)` chunks, respecting
/// `config.max_tokens` with `config.overlap` tokens of continuity between
/// adjacent chunks.
#[must_use]
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<(String, usize)> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let total_tokens = count_tokens(text);
    if total_tokens <= config.max_tokens {
        return vec![(text.to_string(), total_tokens)];
    }

    let paragraphs = split_paragraphs(text);
    let mut chunks: Vec<String> = Vec::new();
    let mut buffer: Vec<String> = Vec::new();
    let mut buffer_tokens = 0usize;

    for para in paragraphs {
        let para_tokens = count_tokens(&para);

        if para_tokens > config.max_tokens {
            if !buffer.is_empty() {
                chunks.push(buffer.join("\n\n"));
                buffer.clear();
                buffer_tokens = 0;
            }
            chunk_sentences(&para, config.max_tokens, config.overlap, &mut chunks);
            continue;
        }

        if buffer_tokens + para_tokens > config.max_tokens {
            if !buffer.is_empty() {
                chunks.push(buffer.join("\n\n"));
            }
            let trailing = buffer.pop();
            buffer.clear();
            buffer_tokens = 0;
            if let Some(trailing_para) = trailing {
                if para_tokens <= config.overlap {
                    let trailing_tokens = count_tokens(&trailing_para);
                    buffer.push(trailing_para);
                    buffer_tokens = trailing_tokens;
                }
            }
        }

        buffer.push(para);
        buffer_tokens += para_tokens;
    }

    if !buffer.is_empty() {
        chunks.push(buffer.join("\n\n"));
    }

    chunks
        .into_iter()
        .map(|c| {
            let tokens = count_tokens(&c);
            (c, tokens)
        })
        .collect()
}

fn role_label(role: Option<Role>) -> &'static str {
    match role {
        Some(Role::Planner) => "planner",
        Some(Role::Critic) => "critic",
        Some(Role::Implementer) => "implementer",
        Some(Role::Tester) => "tester",
        Some(Role::Pm) => "pm",
        Some(Role::Scribe) => "scribe",
        None => "",
    }
}

fn entry_type_label(entry_type: Option<EntryType>) -> &'static str {
    match entry_type {
        Some(EntryType::Note) => "note",
        Some(EntryType::Plan) => "plan",
        Some(EntryType::Decision) => "decision",
        Some(EntryType::Pr) => "pr",
        Some(EntryType::Closure) => "closure",
        None => "",
    }
}

fn header_text(entry: &EntryNode) -> String {
    let fields = [
        format!("agent: {}", entry.agent),
        format!("role: {}", role_label(entry.role)),
        format!("type: {}", entry_type_label(entry.entry_type)),
        format!("title: {}", entry.title.clone().unwrap_or_default()),
        format!("timestamp: {}", entry.timestamp),
    ];
    fields.join("\n").trim().to_string()
}

/// Chunks one entry's body (and, under the watercooler preset, a synthetic
/// metadata header chunk at index 0) into `ChunkNode`s.
#[must_use]
pub fn chunk_entry(entry: &EntryNode, config: &ChunkerConfig) -> Vec<ChunkNode> {
    let mut nodes = Vec::new();
    let mut index = 0usize;

    if config.include_header {
        let header = header_text(entry);
        if !header.is_empty() {
            let tokens = count_tokens(&header);
            nodes.push(ChunkNode {
                chunk_id: chunk_id(&entry.entry_id, index, &header),
                entry_id: entry.entry_id.clone(),
                thread_id: entry.thread_id.clone(),
                index,
                text: header,
                token_count: tokens,
                event_time: Some(entry.timestamp.clone()),
                embedding: None,
            });
            index += 1;
        }
    }

    for (text, tokens) in chunk_text(&entry.body, config) {
        nodes.push(ChunkNode {
            chunk_id: chunk_id(&entry.entry_id, index, &text),
            entry_id: entry.entry_id.clone(),
            thread_id: entry.thread_id.clone(),
            index,
            text,
            token_count: tokens,
            event_time: Some(entry.timestamp.clone()),
            embedding: None,
        });
        index += 1;
    }

    nodes
}

/// Chunks every entry, returning the flat chunk list, a `CONTAINS` edge per
/// chunk, and the `entry_id -> [chunk_id]` map to write back onto entries.
#[must_use]
pub fn chunk_entries(
    entries: &[EntryNode],
    config: &ChunkerConfig,
) -> (Vec<ChunkNode>, Vec<Edge>, std::collections::HashMap<String, Vec<String>>) {
    let mut all_chunks = Vec::new();
    let mut edges = Vec::new();
    let mut entry_to_chunks = std::collections::HashMap::new();

    for entry in entries {
        let chunks = chunk_entry(entry, config);
        let ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        for chunk in &chunks {
            edges.push(Edge::contains(&entry.entry_id, &chunk.chunk_id, chunk.event_time.clone()));
        }
        all_chunks.extend(chunks);
        entry_to_chunks.insert(entry.entry_id.clone(), ids);
    }

    (all_chunks, edges, entry_to_chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry_with_id(entry_id: &str, body: &str) -> EntryNode {
        EntryNode {
            entry_id: entry_id.to_string(),
            thread_id: "t".to_string(),
            index: 0,
            agent: "alice".to_string(),
            role: Some(Role::Planner),
            entry_type: Some(EntryType::Note),
            title: Some("Title".to_string()),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            body: body.to_string(),
            chunk_ids: Vec::new(),
            sequence_index: 0,
            preceding_entry_id: None,
            following_entry_id: None,
            summary: None,
            embedding: None,
        }
    }

    fn make_entry(body: &str) -> EntryNode {
        make_entry_with_id("t:0", body)
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let config = ChunkerConfig::default();
        let chunks = chunk_text("hello world", &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, "hello world");
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let config = ChunkerConfig::default();
        assert!(chunk_text("   \n\n  ", &config).is_empty());
    }

    #[test]
    fn oversized_body_splits_into_multiple_paragraph_chunks() {
        let config = ChunkerConfig {
            max_tokens: 10,
            overlap: 3,
            include_header: false,
        };
        let para = "word ".repeat(20);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunks = chunk_text(&text, &config);
        assert!(chunks.len() > 1);
        for (_, tokens) in &chunks {
            assert!(*tokens > 0);
        }
    }

    #[test]
    fn oversized_paragraph_falls_back_to_sentence_splitting() {
        let config = ChunkerConfig {
            max_tokens: 5,
            overlap: 2,
            include_header: false,
        };
        let text = "One sentence here. Another sentence follows. A third one arrives too.";
        let chunks = chunk_text(text, &config);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn header_chunk_is_prepended_under_watercooler_preset() {
        let entry = make_entry("Short body.");
        let config = ChunkerConfig::watercooler_preset();
        let chunks = chunk_entry(&entry, &config);
        assert_eq!(chunks[0].index, 0);
        assert!(chunks[0].text.contains("agent: alice"));
        assert_eq!(chunks[1].index, 1);
        assert_eq!(chunks[1].text, "Short body.");
    }

    #[test]
    fn empty_body_with_no_header_yields_no_chunks() {
        let entry = make_entry("");
        let config = ChunkerConfig::default();
        assert!(chunk_entry(&entry, &config).is_empty());
    }

    #[test]
    fn chunk_id_is_stable_for_same_inputs() {
        let a = chunk_id("e1", 0, "hello");
        let b = chunk_id("e1", 0, "hello");
        let c = chunk_id("e1", 1, "hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn chunk_entries_builds_contains_edges_and_mapping() {
        let entries = vec![
            make_entry_with_id("t:0", "Body one."),
            make_entry_with_id("t:1", "Body two."),
        ];
        let config = ChunkerConfig::default();
        let (chunks, edges, mapping) = chunk_entries(&entries, &config);
        assert_eq!(chunks.len(), 2);
        assert_eq!(edges.len(), 2);
        assert_eq!(mapping.len(), 2);
    }
}
