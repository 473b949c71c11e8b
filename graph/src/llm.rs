//! Thin wrappers around the LLM and embedding HTTP APIs, with retry and
//! redaction-safe error messages.

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs, EmbeddingInput,
};
use async_openai::Client;
use common::config::{EmbeddingConfig, LlmConfig};
use common::error::AppError;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You summarize a single conversation entry in two or three sentences, preserving concrete decisions and action items. Respond with only the summary text.";

const THREAD_SUMMARY_SYSTEM_PROMPT: &str =
    "You summarize a conversation thread from its entry summaries in a short paragraph. Respond with only the summary text.";

/// Chat-completion client bound to the configured LLM endpoint.
pub struct LlmClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl LlmClient {
    #[must_use]
    pub fn new(config: &LlmConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone().unwrap_or_default())
            .with_api_base(config.base_url.clone());
        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
        }
    }

    /// Summarizes a single entry body, given grounding context fields.
    pub async fn summarize_entry(
        &self,
        agent: &str,
        role: &str,
        entry_type: &str,
        title: &str,
        body: &str,
    ) -> Result<String, AppError> {
        let user_message = format!(
            "agent: {agent}\nrole: {role}\ntype: {entry_type}\ntitle: {title}\n\n{body}"
        );
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessage::from(SUMMARY_SYSTEM_PROMPT).into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build chat request: {e}")))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| AppError::Transient(format!("chat completion request failed: {e}")))?;
        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| AppError::Backend("LLM response had no content".to_string()))
    }

    /// Summarizes a thread from its entries' already-computed summaries.
    pub async fn summarize_thread(&self, entry_summaries: &[String]) -> Result<String, AppError> {
        let bulleted = entry_summaries
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n");
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessage::from(THREAD_SUMMARY_SYSTEM_PROMPT).into(),
                ChatCompletionRequestUserMessage::from(bulleted).into(),
            ])
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build chat request: {e}")))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| AppError::Transient(format!("chat completion request failed: {e}")))?;
        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| AppError::Backend("LLM response had no content".to_string()))
    }
}

/// Embedding client bound to the configured embedding endpoint, with
/// exponential-backoff retry on transient failures.
pub struct EmbeddingClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl EmbeddingClient {
    #[must_use]
    pub fn new(config: &EmbeddingConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone().unwrap_or_default())
            .with_api_base(config.base_url.clone());
        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
        }
    }

    /// Embeds a batch of texts, retrying up to 3 times with base-2s
    /// exponential backoff on a retryable `AppError`. Results are reordered
    /// to match `texts` by the server-reported `index`, not response order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut attempt = 0u32;
        let mut delay = Duration::from_secs(2);
        loop {
            match self.embed_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) if err.is_retryable() && attempt < 2 => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(texts.to_vec()))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build embedding request: {e}")))?;

        let response = self.client.embeddings().create(request).await.map_err(|e| {
            AppError::Transient(format!("embedding request failed: {e}"))
        })?;

        let mut ordered = vec![Vec::new(); texts.len()];
        for item in response.data {
            if let Some(slot) = ordered.get_mut(item.index as usize) {
                *slot = item.embedding;
            }
        }
        Ok(ordered)
    }
}
