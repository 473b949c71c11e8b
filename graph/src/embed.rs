//! Batch embedding across threads, entries, and chunks, consulting the
//! embedding cache before dispatching any network work.

use std::sync::Arc;

use cache::EmbeddingCache;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::llm::EmbeddingClient;

/// One item queued for embedding: its position in the output vector and the
/// text to embed.
struct PendingItem {
    index: usize,
    text: String,
}

/// Embeds `texts` in order, consulting `cache` first and only sending cache
/// misses over the wire in batches of `batch_size`, bounded by a semaphore of
/// `max_concurrent` permits. The returned vector preserves input order
/// regardless of completion order. A failed batch leaves its slots as `None`
/// and appends a warning; it does not fail the whole call.
pub async fn embed_texts(
    texts: &[String],
    cache: &EmbeddingCache,
    client: &EmbeddingClient,
    batch_size: usize,
    max_concurrent: usize,
    warnings: &mut Vec<String>,
) -> Vec<Option<Vec<f32>>> {
    let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
    let mut pending: Vec<PendingItem> = Vec::new();

    for (index, text) in texts.iter().enumerate() {
        if let Some(cached) = cache.get(text) {
            results[index] = Some(cached);
        } else {
            pending.push(PendingItem {
                index,
                text: text.clone(),
            });
        }
    }

    if pending.is_empty() {
        return results;
    }

    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut batches: Vec<Vec<PendingItem>> = Vec::new();
    let mut current = Vec::new();
    for item in pending {
        current.push(item);
        if current.len() >= batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    let mut tasks = FuturesUnordered::new();
    for batch in batches {
        let semaphore = Arc::clone(&semaphore);
        tasks.push(async move {
            #[allow(clippy::unwrap_used)]
            let _permit = semaphore.acquire().await.unwrap();
            let texts: Vec<String> = batch.iter().map(|i| i.text.clone()).collect();
            let outcome = client.embed_batch(&texts).await;
            (batch, outcome)
        });
    }

    while let Some((batch, outcome)) = tasks.next().await {
        match outcome {
            Ok(vectors) => {
                for (item, vector) in batch.into_iter().zip(vectors.into_iter()) {
                    let _ = cache.set(&item.text, &vector);
                    results[item.index] = Some(vector);
                }
            }
            Err(err) => {
                warnings.push(format!("embedding batch failed: {err}"));
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_hits_skip_the_network_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings")).unwrap();
        cache.set("hello", &[1.0, 2.0]).unwrap();

        let texts = vec!["hello".to_string()];
        // A client pointed at an unroutable base URL would error if called;
        // since "hello" is fully cached, embed_texts must never call it.
        let config = common::config::EmbeddingConfig {
            api_key: Some("test".to_string()),
            model: "test-model".to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
            embedding_dim: 2,
            batch_size: 8,
        };
        let client = EmbeddingClient::new(&config);
        let mut warnings = Vec::new();
        let results = embed_texts(&texts, &cache, &client, 8, 1, &mut warnings).await;
        assert_eq!(results[0], Some(vec![1.0, 2.0]));
        assert!(warnings.is_empty());
    }
}
