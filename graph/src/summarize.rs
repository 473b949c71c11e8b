//! Entry and thread summarization, with an extractive fallback for LLM
//! failures and a passthrough for short entries.

use cache::{SummaryCache, ThreadSummaryCache};
use common::model::{EntryNode, ThreadNode};
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

use crate::llm::LlmClient;

const SHORT_ENTRY_THRESHOLD: usize = 200;
const BODY_PROMPT_CHAR_LIMIT: usize = 4000;
const EXTRACTIVE_CHAR_BUDGET: usize = 500;
const THREAD_LLM_THRESHOLD: usize = 2;

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new(r"(?m)^#{1,2}\s*(.+)$").unwrap())
}

fn role_label(role: Option<common::model::Role>) -> &'static str {
    match role {
        Some(common::model::Role::Planner) => "planner",
        Some(common::model::Role::Critic) => "critic",
        Some(common::model::Role::Implementer) => "implementer",
        Some(common::model::Role::Tester) => "tester",
        Some(common::model::Role::Pm) => "pm",
        Some(common::model::Role::Scribe) => "scribe",
        None => "",
    }
}

fn entry_type_label(entry_type: Option<common::model::EntryType>) -> &'static str {
    match entry_type {
        Some(common::model::EntryType::Note) => "note",
        Some(common::model::EntryType::Plan) => "plan",
        Some(common::model::EntryType::Decision) => "decision",
        Some(common::model::EntryType::Pr) => "pr",
        Some(common::model::EntryType::Closure) => "closure",
        None => "",
    }
}

/// Extracts the leading paragraph (and any `#`/`##` headers found in the
/// body) as a summary when the LLM call failed or was skipped. Never fails:
/// degrades to a plain truncation if no markdown structure is present.
#[must_use]
pub fn extractive_summary(body: &str) -> String {
    let headers: Vec<String> = header_re()
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .collect();

    let first_paragraph = body
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty() && !header_re().is_match(p))
        .unwrap_or("");

    let mut summary = String::new();
    if !headers.is_empty() {
        summary.push_str(&format!("Topics: {}", headers.join(", ")));
    }
    if !first_paragraph.is_empty() {
        if !summary.is_empty() {
            summary.push('\n');
        }
        summary.push_str(first_paragraph);
    }
    if summary.is_empty() {
        summary = body.to_string();
    }

    summary.chars().take(EXTRACTIVE_CHAR_BUDGET).collect()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Produces a summary for one entry: cache hit, short-entry passthrough, LLM
/// call, or extractive fallback on LLM failure. Never returns `Err` — all
/// failure paths degrade to the extractive summary and are logged as
/// warnings by the caller.
pub async fn summarize_entry(
    entry: &EntryNode,
    cache: &SummaryCache,
    llm: &LlmClient,
    warnings: &mut Vec<String>,
) -> String {
    if let Some(cached) = cache.get(&entry.entry_id, &entry.body) {
        return cached;
    }

    if entry.body.chars().count() < SHORT_ENTRY_THRESHOLD {
        let summary = entry.body.clone();
        let _ = cache.set(&entry.entry_id, &entry.body, &summary);
        return summary;
    }

    let truncated_body = truncate_chars(&entry.body, BODY_PROMPT_CHAR_LIMIT);
    let title = entry.title.clone().unwrap_or_default();
    let result = llm
        .summarize_entry(
            &entry.agent,
            role_label(entry.role),
            entry_type_label(entry.entry_type),
            &title,
            &truncated_body,
        )
        .await;

    let summary = match result {
        Ok(summary) => summary,
        Err(err) => {
            warnings.push(format!(
                "summarize_entry fallback for {}: {err}",
                entry.entry_id
            ));
            extractive_summary(&entry.body)
        }
    };

    let _ = cache.set(&entry.entry_id, &entry.body, &summary);
    summary
}

/// Produces a thread-level summary: concatenation for short threads, an LLM
/// call over entry summaries for longer ones, falling back to concatenation
/// on LLM failure.
pub async fn summarize_thread(
    thread: &ThreadNode,
    entry_summaries: &[String],
    cache: &ThreadSummaryCache,
    llm: &LlmClient,
    warnings: &mut Vec<String>,
) -> String {
    if let Some(cached) = cache.get(&thread.thread_id, entry_summaries.len()) {
        return cached;
    }

    let summary = if entry_summaries.len() <= THREAD_LLM_THRESHOLD {
        entry_summaries.join("\n\n")
    } else {
        match llm.summarize_thread(entry_summaries).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(thread_id = %thread.thread_id, error = %err, "thread summary LLM call failed, concatenating");
                warnings.push(format!(
                    "summarize_thread fallback for {}: {err}",
                    thread.thread_id
                ));
                entry_summaries.join("\n\n")
            }
        }
    };

    let _ = cache.set(&thread.thread_id, entry_summaries.len(), &summary);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractive_summary_picks_up_headers_and_paragraph() {
        let body = "# Title\n\nSome opening paragraph.\n\nMore detail.";
        let summary = extractive_summary(body);
        assert!(summary.contains("Topics: Title"));
        assert!(summary.contains("Some opening paragraph."));
    }

    #[test]
    fn extractive_summary_degrades_to_truncation_without_structure() {
        let body = "plain text with no headers at all";
        let summary = extractive_summary(body);
        assert_eq!(summary, body);
    }

    #[test]
    fn extractive_summary_respects_char_budget() {
        let body = "a".repeat(10_000);
        let summary = extractive_summary(&body);
        assert_eq!(summary.chars().count(), EXTRACTIVE_CHAR_BUDGET);
    }
}
