use std::path::PathBuf;

use serde::Deserialize;

use crate::error::AppError;

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "bge_m3".to_string()
}

fn default_embedding_dim() -> usize {
    1024
}

fn default_embedding_batch_size() -> usize {
    8
}

/// Credentials and endpoint for the summarization LLM.
#[derive(Clone, Deserialize, Debug)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
}

impl LlmConfig {
    /// Validates the config, returning a list of human-readable problems (empty if valid).
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            errors.push(format!("llm base_url '{}' must be http(s)", self.base_url));
        }
        errors
    }
}

/// Credentials and endpoint for the embedding API.
#[derive(Clone, Deserialize, Debug)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

impl EmbeddingConfig {
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            errors.push(format!(
                "embedding base_url '{}' must be http(s)",
                self.base_url
            ));
        }
        if self.batch_size == 0 {
            errors.push("embedding batch_size must be at least 1".to_string());
        }
        errors
    }
}

fn default_threads_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_work_dir() -> PathBuf {
    default_cache_dir().join("pipeline_work")
}

fn default_batch_size() -> usize {
    10
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_tokens() -> usize {
    1024
}

fn default_overlap_tokens() -> usize {
    128
}

fn default_test_limit() -> usize {
    5
}

/// Root of the cache directory tree: `~/.watercooler/cache`, overridable by
/// `WATERCOOLER_CACHE_DIR`.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WATERCOOLER_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs_home().join(".watercooler").join("cache")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Top-level pipeline configuration, assembled from the environment.
#[derive(Clone, Deserialize, Debug)]
pub struct PipelineConfig {
    #[serde(default = "default_threads_dir")]
    pub threads_dir: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub leanrag_dir: Option<PathBuf>,
    #[serde(default)]
    pub graphiti_dir: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_test_limit")]
    pub test_limit: usize,
    #[serde(default)]
    pub memory_backend: Option<String>,
}

impl PipelineConfig {
    /// Validates the configuration, returning a list of human-readable problems.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.threads_dir.exists() {
            errors.push(format!(
                "threads_dir '{}' does not exist",
                self.threads_dir.display()
            ));
        }
        if let Some(dir) = &self.leanrag_dir {
            if !dir.exists() {
                errors.push(format!("leanrag_dir '{}' does not exist", dir.display()));
            }
        }
        errors.extend(self.llm.validate());
        errors.extend(self.embedding.validate());
        errors
    }

    /// Creates the per-run work directory layout (`logs`, `state`, `export`,
    /// `extract`, `graph`), matching the layout documented at the backend boundary.
    pub fn ensure_work_dir(&self) -> Result<(), AppError> {
        for sub in ["logs", "state", "export", "extract", "graph"] {
            std::fs::create_dir_all(self.work_dir.join(sub))?;
        }
        Ok(())
    }
}

/// Loads `PipelineConfig` from environment variables, using the same variable
/// names and defaults as the documented environment contract.
pub fn load_config_from_env() -> Result<PipelineConfig, AppError> {
    use config::{Config, Environment};

    let builder = Config::builder()
        .set_default("threads_dir", ".")
        .map_err(AppError::ConfigLoad)?
        .set_default("work_dir", default_work_dir().to_string_lossy().into_owned())
        .map_err(AppError::ConfigLoad)?
        .set_default("batch_size", 10)
        .map_err(AppError::ConfigLoad)?
        .set_default("max_concurrent", 4)
        .map_err(AppError::ConfigLoad)?
        .set_default("max_tokens", 1024)
        .map_err(AppError::ConfigLoad)?
        .set_default("overlap_tokens", 128)
        .map_err(AppError::ConfigLoad)?
        .set_default("test_limit", 5)
        .map_err(AppError::ConfigLoad)?
        .add_source(
            Environment::with_prefix("WC")
                .try_parsing(true)
                .separator("__"),
        );

    let mut raw: serde_json::Value = builder
        .build()
        .map_err(AppError::ConfigLoad)?
        .try_deserialize()
        .map_err(AppError::ConfigLoad)?;

    if let Some(obj) = raw.as_object_mut() {
        if obj.get("llm").is_none() {
            obj.insert("llm".into(), serde_json::json!({}));
        }
        if obj.get("embedding").is_none() {
            obj.insert("embedding".into(), serde_json::json!({}));
        }
        apply_llm_env(obj);
        apply_embedding_env(obj);
        if let Ok(dir) = std::env::var("LEANRAG_DIR") {
            obj.insert("leanrag_dir".into(), serde_json::json!(dir));
        }
        if let Ok(backend) = std::env::var("WC_MEMORY_BACKEND") {
            obj.insert("memory_backend".into(), serde_json::json!(backend));
        }
        // The documented environment contract (§6) uses single-underscore
        // names (WC_THREADS_DIR, WC_PIPELINE_WORK_DIR, WC_BATCH_SIZE,
        // WC_MAX_CONCURRENT), which don't match the generic WC__FIELD
        // double-underscore convention above, so they're applied explicitly.
        if let Ok(dir) = std::env::var("WC_THREADS_DIR") {
            obj.insert("threads_dir".into(), serde_json::json!(dir));
        }
        if let Ok(dir) = std::env::var("WC_PIPELINE_WORK_DIR") {
            obj.insert("work_dir".into(), serde_json::json!(dir));
        }
        if let Ok(size) = std::env::var("WC_BATCH_SIZE") {
            if let Ok(parsed) = size.parse::<usize>() {
                obj.insert("batch_size".into(), serde_json::json!(parsed));
            }
        }
        if let Ok(n) = std::env::var("WC_MAX_CONCURRENT") {
            if let Ok(parsed) = n.parse::<usize>() {
                obj.insert("max_concurrent".into(), serde_json::json!(parsed));
            }
        }
    }

    serde_json::from_value(raw).map_err(AppError::Json)
}

fn apply_llm_env(obj: &mut serde_json::Map<String, serde_json::Value>) {
    let llm = obj
        .entry("llm")
        .or_insert_with(|| serde_json::json!({}))
        .as_object_mut();
    if let Some(llm) = llm {
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            llm.insert("api_key".into(), serde_json::json!(key));
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            llm.insert("model".into(), serde_json::json!(model));
        }
        if let Ok(base) = std::env::var("LLM_API_BASE") {
            llm.insert("base_url".into(), serde_json::json!(base));
        }
    }
}

fn apply_embedding_env(obj: &mut serde_json::Map<String, serde_json::Value>) {
    let embedding = obj
        .entry("embedding")
        .or_insert_with(|| serde_json::json!({}))
        .as_object_mut();
    if let Some(embedding) = embedding {
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            embedding.insert("model".into(), serde_json::json!(model));
        }
        if let Ok(base) = std::env::var("EMBEDDING_API_BASE") {
            embedding.insert("base_url".into(), serde_json::json!(base));
        }
        if let Ok(size) = std::env::var("EMBEDDING_BATCH_SIZE") {
            if let Ok(parsed) = size.parse::<usize>() {
                embedding.insert("batch_size".into(), serde_json::json!(parsed.max(1)));
            }
        }
    }
}
